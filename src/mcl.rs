use std::{
    ffi::OsString,
    ops::Not,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context};
use log::info;

#[derive(Debug, Clone, PartialEq)]
pub struct Mcl {
    pub program: PathBuf,
    pub inflation: f64,
    pub threads: usize,
}

impl Mcl {
    pub fn clusters_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("clusters_I{}.txt", self.inflation))
    }

    fn args(&self, graph: &Path, clusters: &Path) -> Vec<OsString> {
        vec![
            graph.into(),
            "-I".into(),
            self.inflation.to_string().into(),
            "-o".into(),
            clusters.into(),
            "-te".into(),
            self.threads.to_string().into(),
            "-V".into(),
            "all".into(),
        ]
    }

    /// Clusters `graph`, writing the clusters into `output_dir`. Returns the path of the clusters
    /// file.
    pub fn run(&self, graph: &Path, output_dir: &Path) -> anyhow::Result<PathBuf> {
        let clusters = self.clusters_path(output_dir);
        info!("Running MCL with inflation {}", self.inflation);

        let status = Command::new(&self.program)
            .args(self.args(graph, &clusters))
            .status()
            .with_context(|| format!("Unable to run {}", self.program.display()))?;

        if status.success().not() {
            bail!("MCL exited with {status}");
        }

        info!("Clusters written to {}", clusters.display());
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcl(program: &str) -> Mcl {
        Mcl {
            program: program.into(),
            inflation: 1.5,
            threads: 4,
        }
    }

    #[test]
    fn command_line() {
        let mcl = mcl("mcl");
        let clusters = mcl.clusters_path(Path::new("out"));
        assert_eq!(clusters, Path::new("out/clusters_I1.5.txt"));

        let args = mcl.args(Path::new("out/graph.txt"), &clusters);
        assert_eq!(
            args,
            [
                "out/graph.txt",
                "-I",
                "1.5",
                "-o",
                "out/clusters_I1.5.txt",
                "-te",
                "4",
                "-V",
                "all"
            ]
            .map(OsString::from)
        );
    }

    #[test]
    fn missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let err = mcl("/nonexistent/mcl")
            .run(&dir.path().join("graph.txt"), dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("Unable to run"));
    }
}
