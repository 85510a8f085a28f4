//! Baseline Commands

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Subcommand;

use visreg_common::{FsBlobStore, TargetKey, ViewportClass};
use visreg_engine::BaselineStore;

use super::run::parse_viewport;
use crate::output::{print_list, print_success, OutputFormat};

#[derive(Subcommand, Debug)]
pub enum BaselineCommands {
    /// List stored baselines
    List,

    /// Show every stored version of a baseline
    History {
        /// Page id
        page: String,

        /// Viewport class
        #[arg(value_parser = parse_viewport)]
        viewport: ViewportClass,
    },

    /// Make an earlier version the active baseline again
    Rollback {
        /// Page id
        page: String,

        /// Viewport class
        #[arg(value_parser = parse_viewport)]
        viewport: ViewportClass,

        /// Version to restore
        #[arg(long = "to")]
        to_version: u32,
    },

    /// Delete old inactive versions
    Prune {
        /// Page id
        page: String,

        /// Viewport class
        #[arg(value_parser = parse_viewport)]
        viewport: ViewportClass,

        /// Inactive versions to keep
        #[arg(long, default_value = "5")]
        keep_last: usize,
    },
}

pub async fn execute(cmd: BaselineCommands, store: PathBuf, format: OutputFormat) -> Result<()> {
    let blobs = Arc::new(FsBlobStore::new(&store).await?);
    let baselines = BaselineStore::new(blobs);

    match cmd {
        BaselineCommands::List => {
            let summaries = baselines.list().await?;
            print_list(&summaries, format);
        }

        BaselineCommands::History { page, viewport } => {
            let history = baselines.history(&TargetKey::new(page, viewport)).await?;
            print_list(&history.versions, format);
            if let (Some(active), OutputFormat::Table) = (history.active, format) {
                println!("Active: v{}", active);
            }
        }

        BaselineCommands::Rollback {
            page,
            viewport,
            to_version,
        } => {
            let key = TargetKey::new(page, viewport);
            let restored = baselines.rollback(&key, to_version).await?;
            print_success(&format!(
                "Restored {} v{} as v{}",
                key, to_version, restored.version
            ));
        }

        BaselineCommands::Prune {
            page,
            viewport,
            keep_last,
        } => {
            let key = TargetKey::new(page, viewport);
            let removed = baselines.prune(&key, keep_last).await?;
            print_success(&format!("Pruned {} version(s) of {}", removed, key));
        }
    }

    Ok(())
}
