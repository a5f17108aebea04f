//! factoryindex-evm: EVM log source, ABI decoding, and the per-chain index loop.

pub mod abi;
pub mod builder;
pub mod fetcher;
pub mod index_loop;
pub mod normalizer;
pub mod rpc;
pub mod supervisor;

pub use abi::AbiRegistry;
pub use builder::IndexerBuilder;
pub use fetcher::ChainLogSource;
pub use index_loop::{BatchEnd, BlockProcessor, ChainPipeline, PipelineExit};
pub use rpc::{EvmRpcClient, HttpRpcClient, RpcLog, RpcReceipt};
pub use supervisor::{ChainReport, Supervisor};
