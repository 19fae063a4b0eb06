mod best_hits;
mod cli;
mod graph;
mod hits;
mod matrix_store;
mod mcl;
mod normalize;
mod pipeline;
mod scheduler;
mod sparse;
mod species;
mod summary;

use std::{fs, ops::Not, path::Path};

use anyhow::{bail, Context};
use clap::Parser;
use itertools::Itertools;
use log::info;

use crate::{
    cli::{Cli, StoreKind},
    hits::InputDir,
    matrix_store::{DiskStore, MemoryStore, Store},
    mcl::Mcl,
    pipeline::GraphBuilder,
};

const GRAPH_FILE: &str = "graph.txt";
const MATRICES_DIR: &str = "matrices";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    prepare_output_dir(&cli.output, cli.overwrite)?;

    let input = InputDir::new(&cli.input);
    let species_ids = match &cli.species {
        Some(ids) => ids.clone(),
        None => input
            .discover_species()
            .context("Unable to list the species of the input directory")?,
    };
    let species = input.load_species(&species_ids)?;
    info!(
        "Loaded {} genes of species {}",
        species.total_genes(),
        species_ids.iter().join(", ")
    );

    let store = match cli.store_args.store {
        StoreKind::Disk => Store::Disk(DiskStore::create(cli.output.join(MATRICES_DIR))?),
        StoreKind::Memory => Store::Memory(MemoryStore::new()),
    };

    let config = cli.graph_config();
    let graph_path = cli.output.join(GRAPH_FILE);
    let summary = GraphBuilder {
        config: &config,
        species: &species,
        source: &input,
        store: &store,
    }
    .build(&graph_path, &cli.output)?;

    if let Store::Disk(store) = &store {
        if config.keep_matrices.not() {
            fs::remove_dir(store.dir()).with_context(|| {
                format!("Unable to remove directory {}", store.dir().display())
            })?;
        }
    }

    eprintln!("{}", summary.species_table());
    eprintln!("{}", summary.pairs_table());
    summary.write_files(&cli.output)?;

    if let Some(program) = &cli.clustering_args.mcl {
        let threads = config.threads.unwrap_or_else(num_cpus::get);
        Mcl {
            program: program.clone(),
            inflation: cli.clustering_args.inflation,
            threads,
        }
        .run(&graph_path, &cli.output)?;
    }

    Ok(())
}

fn prepare_output_dir(path: &Path, overwrite: bool) -> anyhow::Result<()> {
    if path.exists() {
        if overwrite.not() {
            bail!(
                "Output directory {} already exists, use --overwrite to replace it",
                path.display()
            );
        }

        fs::remove_dir_all(path).context("Unable to remove output directory")?;
    }

    fs::create_dir_all(path).context("Unable to create output directory")
}
