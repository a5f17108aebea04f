//! Runs one pipeline per chain and coordinates shutdown.
//!
//! Chains are isolated: a fatal error stops only the chain that raised it.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use factoryindex_core::error::IndexerError;

use crate::index_loop::{ChainPipeline, PipelineExit};
use crate::rpc::EvmRpcClient;

/// Final state of one chain's pipeline.
#[derive(Debug)]
pub struct ChainReport {
    pub chain: String,
    pub result: Result<PipelineExit, IndexerError>,
}

impl ChainReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Owns the shutdown signal and the per-chain tasks.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<ChainReport>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// A receiver that flips to `true` on [`shutdown`](Self::shutdown).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run `pipeline` on its own task.
    pub fn spawn<C>(&mut self, mut pipeline: ChainPipeline<C>)
    where
        C: EvmRpcClient + 'static,
    {
        let shutdown = self.subscribe();
        let chain = pipeline.chain().to_string();
        tracing::info!(chain = %chain, chain_id = pipeline.chain_id(), "Spawning chain pipeline");
        self.tasks.spawn(async move {
            let result = pipeline.run(shutdown).await;
            ChainReport { chain, result }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ask every pipeline to stop at its next block boundary.
    pub fn shutdown(&self) {
        tracing::info!(chains = self.tasks.len(), "Shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Wait for every pipeline to finish.
    pub async fn join_all(self) -> Vec<ChainReport> {
        self.join_until(std::future::pending::<()>()).await
    }

    /// Wait for every pipeline to finish, requesting shutdown once `signal`
    /// resolves (e.g. on Ctrl-C).
    pub async fn join_until<F>(mut self, signal: F) -> Vec<ChainReport>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut signalled = false;
        let mut reports = Vec::with_capacity(self.tasks.len());
        loop {
            tokio::select! {
                _ = &mut signal, if !signalled => {
                    signalled = true;
                    self.shutdown();
                }
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => reports.push(report(joined)),
                    None => break,
                },
            }
        }
        reports
    }
}

fn report(joined: Result<ChainReport, JoinError>) -> ChainReport {
    let report = joined.unwrap_or_else(|e| ChainReport {
        chain: "<unknown>".into(),
        result: Err(IndexerError::Aborted {
            reason: format!("pipeline task failed: {e}"),
        }),
    });
    match &report.result {
        Ok(exit) => tracing::info!(chain = %report.chain, ?exit, "Chain finished"),
        Err(e) => tracing::error!(chain = %report.chain, error = %e, "Chain failed"),
    }
    report
}
