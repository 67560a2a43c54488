//! Build functions: the callables attached to targets that produce them.

use crate::graph::TargetId;
use crate::hash::Hash;
use crate::value::Value;
use crate::work::BuildCx;

/// A source position reported in a build function's error trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLoc {
    pub file: String,
    pub line: usize,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A failure raised by a build function.
#[derive(Debug, Clone)]
pub struct BuildError {
    pub message: String,
    pub trace: Vec<SourceLoc>,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        BuildError {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: usize) -> Self {
        self.trace.push(SourceLoc {
            file: file.into(),
            line,
        });
        self
    }
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.message)?;
        for loc in &self.trace {
            write!(f, "\n\t{}", loc)?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildError {}

impl From<anyhow::Error> for BuildError {
    fn from(err: anyhow::Error) -> Self {
        BuildError::new(format!("{:#}", err))
    }
}

/// The function that builds a target.  It runs with the global lock held
/// and may call back into the engine through `cx`.
pub trait BuildFn: Send + Sync {
    fn call(&self, cx: &mut BuildCx<'_>, target: TargetId) -> Result<Value, BuildError>;

    /// Stable identity of the function's definition.  A change here makes
    /// the target stale.
    fn hash(&self) -> Hash;
}

/// A closure-backed `BuildFn` whose identity is derived from a source string.
pub struct Rule<F> {
    identity: Hash,
    f: F,
}

impl<F> Rule<F>
where
    F: Fn(&mut BuildCx<'_>, TargetId) -> Result<Value, BuildError> + Send + Sync,
{
    pub fn new(identity: impl AsRef<[u8]>, f: F) -> Self {
        Rule {
            identity: Hash::of(identity.as_ref()),
            f,
        }
    }
}

impl<F> BuildFn for Rule<F>
where
    F: Fn(&mut BuildCx<'_>, TargetId) -> Result<Value, BuildError> + Send + Sync,
{
    fn call(&self, cx: &mut BuildCx<'_>, target: TargetId) -> Result<Value, BuildError> {
        (self.f)(cx, target)
    }

    fn hash(&self) -> Hash {
        self.identity
    }
}
