//! Graphviz output of the dependencies the build discovered.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Edge {
    /// Declared before building.
    Static,
    /// Recorded while a build function ran.
    Build,
    /// A member of a scan's result.
    Scan,
    /// From a target to the target whose build function defined it.
    Parent,
}

pub struct DotWriter {
    w: BufWriter<File>,
}

impl DotWriter {
    pub fn create(path: &Path) -> std::io::Result<DotWriter> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "digraph Dependencies {{")?;
        writeln!(w, "\tnode [shape=box];")?;
        Ok(DotWriter { w })
    }

    pub fn node(&mut self, id: &str, updated: bool) -> std::io::Result<()> {
        let color = if updated { "green" } else { "white" };
        writeln!(
            self.w,
            "\t{:?} [style=filled fillcolor={}];",
            id, color
        )
    }

    pub fn edge(&mut self, from: &str, to: &str, kind: Edge) -> std::io::Result<()> {
        let attrs = match kind {
            Edge::Static => "",
            Edge::Build => " [style=dotted]",
            Edge::Scan => " [style=dashed]",
            Edge::Parent => " [color=red]",
        };
        writeln!(self.w, "\t{:?} -> {:?}{};", from, to, attrs)
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        writeln!(self.w, "}}")?;
        self.w.flush()
    }
}
