//! End-to-end tests of the chain pipeline against a scripted in-process node.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use tokio::sync::watch;

use factoryindex_core::config::ChainConfig;
use factoryindex_core::discovery::DiscoveryRule;
use factoryindex_core::error::IndexerError;
use factoryindex_core::handler::{BlockHandler, ReorgHandler};
use factoryindex_core::reorg::ReorgEvent;
use factoryindex_core::retry::RetryConfig;
use factoryindex_core::types::{BlockLogs, BlockSummary, ChainId, ContractRole, IndexContext};
use factoryindex_evm::{
    AbiRegistry, EvmRpcClient, IndexerBuilder, PipelineExit, RpcLog, RpcReceipt, Supervisor,
};
use factoryindex_storage::Storage;

const BASE: ChainId = 8453;
const FACTORY: Address = Address::repeat_byte(0xf0);
const POOL_A: Address = Address::repeat_byte(0xaa);
const POOL_B: Address = Address::repeat_byte(0xbb);
const POOL_C: Address = Address::repeat_byte(0xcc);
const POSITION: Address = Address::repeat_byte(0xd0);
const USER: Address = Address::repeat_byte(0x11);

const FACTORY_ABI: &str = r#"[
  {
    "type": "event",
    "name": "LendingPoolCreated",
    "anonymous": false,
    "inputs": [
      {"name": "collateralToken", "type": "address", "indexed": true},
      {"name": "borrowToken", "type": "address", "indexed": true},
      {"name": "lendingPool", "type": "address", "indexed": true},
      {"name": "ltv", "type": "uint256", "indexed": false}
    ]
  }
]"#;

const POOL_ABI: &str = r#"[
  {
    "type": "event",
    "name": "SupplyLiquidity",
    "anonymous": false,
    "inputs": [
      {"name": "user", "type": "address", "indexed": true},
      {"name": "amount", "type": "uint256", "indexed": false},
      {"name": "shares", "type": "uint256", "indexed": false}
    ]
  },
  {
    "type": "event",
    "name": "CreatePosition",
    "anonymous": false,
    "inputs": [
      {"name": "user", "type": "address", "indexed": true},
      {"name": "positionAddress", "type": "address", "indexed": true}
    ]
  }
]"#;

// ─── Scripted node ────────────────────────────────────────────────────────────

fn block_hash(number: u64, fork: u8) -> B256 {
    let mut hash = B256::left_padding_from(&number.to_be_bytes());
    hash.0[0] = fork;
    hash
}

fn tx_hash(block: u64, log_index: u64) -> B256 {
    let mut hash = B256::ZERO;
    hash.0[0] = 0xee;
    hash.0[16..24].copy_from_slice(&block.to_be_bytes());
    hash.0[24..].copy_from_slice(&log_index.to_be_bytes());
    hash
}

#[derive(Clone)]
struct ScriptedLog {
    block: u64,
    log_index: u64,
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    /// Only present on this fork; `None` means every fork.
    fork: Option<u8>,
}

impl ScriptedLog {
    fn on_fork(mut self, fork: u8) -> Self {
        self.fork = Some(fork);
        self
    }
}

#[derive(Default)]
struct MockChain {
    head: AtomicU64,
    logs: Vec<ScriptedLog>,
    /// Blocks at or above `.0` belong to fork `.1`.
    fork: Mutex<Option<(u64, u8)>>,
    /// When header `.0` is first requested, switch to fork `.2` from block `.1`.
    fork_trigger: Mutex<Option<(u64, u64, u8)>>,
    /// Number of upcoming `eth_getLogs` calls that fail with a transient error.
    failing_log_calls: AtomicU32,
    log_calls: Mutex<Vec<(u64, u64)>>,
    /// Number of upcoming receipt lookups answered with `null`.
    missing_receipts: AtomicU32,
    receipt_calls: Mutex<Vec<B256>>,
}

impl MockChain {
    fn new(head: u64, logs: Vec<ScriptedLog>) -> Arc<Self> {
        Arc::new(Self {
            head: AtomicU64::new(head),
            logs,
            ..Default::default()
        })
    }

    fn fork_of(&self, number: u64) -> u8 {
        match *self.fork.lock().unwrap() {
            Some((from, fork)) if number >= from => fork,
            _ => 0,
        }
    }

    fn log_calls(&self) -> Vec<(u64, u64)> {
        self.log_calls.lock().unwrap().clone()
    }

    fn receipt_calls(&self) -> Vec<B256> {
        self.receipt_calls.lock().unwrap().clone()
    }
}

struct Node(Arc<MockChain>);

#[async_trait]
impl EvmRpcClient for Node {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        Ok(self.0.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        let chain = &self.0;
        {
            let mut trigger = chain.fork_trigger.lock().unwrap();
            if let Some((at, from, fork)) = *trigger {
                if at == number {
                    *chain.fork.lock().unwrap() = Some((from, fork));
                    *trigger = None;
                }
            }
        }
        if number > chain.head.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let parent = number.saturating_sub(1);
        Ok(Some(BlockSummary {
            number,
            hash: block_hash(number, chain.fork_of(number)),
            parent_hash: block_hash(parent, chain.fork_of(parent)),
            timestamp: 1_700_000_000 + number * 2,
        }))
    }

    async fn logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[Address],
    ) -> Result<Vec<RpcLog>, IndexerError> {
        let chain = &self.0;
        chain.log_calls.lock().unwrap().push((from, to));
        if chain
            .failing_log_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IndexerError::transient("429 Too Many Requests"));
        }

        Ok(chain
            .logs
            .iter()
            .filter(|l| (from..=to).contains(&l.block) && addresses.contains(&l.address))
            .filter(|l| l.fork.map_or(true, |f| f == chain.fork_of(l.block)))
            .map(|l| RpcLog {
                address: l.address,
                topics: l.topics.clone(),
                data: l.data.clone(),
                block_number: Some(U64::from(l.block)),
                block_hash: Some(block_hash(l.block, chain.fork_of(l.block))),
                transaction_hash: Some(tx_hash(l.block, l.log_index)),
                log_index: Some(U64::from(l.log_index)),
                removed: false,
            })
            .collect())
    }

    async fn transaction_receipt(&self, tx: B256) -> Result<Option<RpcReceipt>, IndexerError> {
        let chain = &self.0;
        chain.receipt_calls.lock().unwrap().push(tx);
        if chain
            .missing_receipts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        let Some(log) = chain
            .logs
            .iter()
            .find(|l| tx_hash(l.block, l.log_index) == tx)
        else {
            return Ok(None);
        };
        Ok(Some(RpcReceipt {
            transaction_hash: tx,
            block_hash: block_hash(log.block, chain.fork_of(log.block)),
            block_number: U64::from(log.block),
            from: USER,
            to: Some(log.address),
            contract_address: None,
            status: Some(U64::from(1)),
            gas_used: U64::from(50_000 + log.block),
            effective_gas_price: None,
        }))
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

fn abis() -> Arc<AbiRegistry> {
    let mut abis = AbiRegistry::new();
    abis.insert_json("LendingPoolFactory", FACTORY_ABI).unwrap();
    abis.insert_json("LendingPool", POOL_ABI).unwrap();
    abis.insert_json("Position", POOL_ABI).unwrap();
    Arc::new(abis)
}

fn selector(abi_id: &str, event: &str) -> B256 {
    abis().event_by_name(abi_id, event).unwrap().selector()
}

fn words(values: &[u64]) -> Bytes {
    let mut data = Vec::with_capacity(values.len() * 32);
    for v in values {
        data.extend_from_slice(&U256::from(*v).to_be_bytes::<32>());
    }
    Bytes::from(data)
}

fn created(block: u64, log_index: u64, pool: Address) -> ScriptedLog {
    ScriptedLog {
        block,
        log_index,
        address: FACTORY,
        topics: vec![
            selector("LendingPoolFactory", "LendingPoolCreated"),
            Address::repeat_byte(0x01).into_word(),
            Address::repeat_byte(0x02).into_word(),
            pool.into_word(),
        ],
        data: words(&[7_000]),
        fork: None,
    }
}

fn supply(block: u64, log_index: u64, pool: Address, amount: u64) -> ScriptedLog {
    ScriptedLog {
        block,
        log_index,
        address: pool,
        topics: vec![selector("LendingPool", "SupplyLiquidity"), USER.into_word()],
        data: words(&[amount, amount]),
        fork: None,
    }
}

fn create_position(block: u64, log_index: u64, pool: Address, position: Address) -> ScriptedLog {
    ScriptedLog {
        block,
        log_index,
        address: pool,
        topics: vec![
            selector("LendingPool", "CreatePosition"),
            USER.into_word(),
            position.into_word(),
        ],
        data: Bytes::new(),
        fork: None,
    }
}

fn garbage(block: u64, log_index: u64, address: Address) -> ScriptedLog {
    ScriptedLog {
        block,
        log_index,
        address,
        topics: vec![B256::repeat_byte(0xde)],
        data: Bytes::new(),
        fork: None,
    }
}

fn pool_rule() -> DiscoveryRule {
    DiscoveryRule {
        source_abi_id: "LendingPoolFactory".into(),
        event_name: "LendingPoolCreated".into(),
        parameter: "lendingPool".into(),
        child_role: ContractRole::Pool,
        child_abi_id: "LendingPool".into(),
    }
}

fn position_rule() -> DiscoveryRule {
    DiscoveryRule {
        source_abi_id: "LendingPool".into(),
        event_name: "CreatePosition".into(),
        parameter: "positionAddress".into(),
        child_role: ContractRole::Position,
        child_abi_id: "Position".into(),
    }
}

fn builder(chain: &str, chain_id: ChainId, storage: &Storage, to_block: u64) -> IndexerBuilder {
    IndexerBuilder::new(chain, ChainConfig::new(chain_id, "http://mock.invalid"))
        .start_block(100)
        .to_block(to_block)
        .confirmation_depth(0)
        .batch_size(4)
        .poll_interval_ms(10)
        .retry(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        })
        .watch(FACTORY, ContractRole::Factory, "LendingPoolFactory", 100)
        .discovery_rule(pool_rule())
        .decoder(abis())
        .backend(storage)
}

fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn blocks_of(storage: &Storage, chain_id: ChainId, event: &str) -> Vec<(u64, Address)> {
    storage
        .events
        .events(chain_id, Some(event), 1_000)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.block_number, e.address))
        .collect()
}

async fn watched(storage: &Storage, chain_id: ChainId) -> Vec<(Address, u64)> {
    let mut entries: Vec<_> = storage
        .registry
        .load_addresses(chain_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.address, e.discovered_at_block))
        .collect();
    entries.sort();
    entries
}

async fn checkpoint_block(storage: &Storage, chain_id: ChainId) -> Option<u64> {
    storage
        .checkpoints
        .load(chain_id)
        .await
        .unwrap()
        .map(|v| v.cursor.last_processed_block)
}

fn discovery_script() -> Vec<ScriptedLog> {
    vec![
        created(101, 0, POOL_A),
        // Same block as its creation: not yet visible
        supply(101, 1, POOL_A, 1),
        supply(102, 0, POOL_A, 500),
        // Duplicate announcement
        created(104, 3, POOL_A),
        created(106, 0, POOL_B),
        supply(106, 1, POOL_B, 2),
        supply(107, 0, POOL_B, 900),
        supply(109, 2, POOL_A, 250),
    ]
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ReorgLog(Mutex<Vec<ReorgEvent>>);

#[async_trait]
impl ReorgHandler for ReorgLog {
    async fn on_reorg(&self, reorg: &ReorgEvent, _ctx: &IndexContext) -> Result<(), IndexerError> {
        self.0.lock().unwrap().push(reorg.clone());
        Ok(())
    }
}

struct StopAfter {
    block: u64,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl BlockHandler for StopAfter {
    async fn handle_block(&self, block: &BlockLogs, _ctx: &IndexContext) -> Result<(), IndexerError> {
        if block.number == self.block {
            self.shutdown.send_replace(true);
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn discovered_pools_are_indexed_from_the_next_block() {
    let chain = MockChain::new(115, discovery_script());
    let storage = Storage::memory();
    let mut pipeline = builder("base", BASE, &storage, 115)
        .build(Node(chain.clone()))
        .await
        .unwrap();

    let (_tx, rx) = no_shutdown();
    let exit = pipeline.run(rx).await.unwrap();
    assert_eq!(exit, PipelineExit::Completed { last_block: Some(115) });

    assert_eq!(
        watched(&storage, BASE).await,
        vec![(POOL_A, 101), (POOL_B, 106), (FACTORY, 100)]
    );
    assert_eq!(
        blocks_of(&storage, BASE, "LendingPoolCreated").await,
        vec![(101, FACTORY), (104, FACTORY), (106, FACTORY)]
    );
    // Logs in the creation block itself never reach the sink
    assert_eq!(
        blocks_of(&storage, BASE, "SupplyLiquidity").await,
        vec![(102, POOL_A), (107, POOL_B), (109, POOL_A)]
    );
    assert_eq!(checkpoint_block(&storage, BASE).await, Some(115));

    // Fetching restarts right after each discovery block with the grown set
    let calls = chain.log_calls();
    assert_eq!(calls[0], (100, 103));
    assert!(calls.contains(&(102, 105)));
    assert!(calls.contains(&(107, 110)));
}

#[tokio::test]
async fn decoded_arguments_reach_the_sink() {
    let chain = MockChain::new(103, discovery_script());
    let storage = Storage::memory();
    let mut pipeline = builder("base", BASE, &storage, 103)
        .build(Node(chain))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    pipeline.run(rx).await.unwrap();

    let supplies = storage
        .events
        .events(BASE, Some("SupplyLiquidity"), 10)
        .await
        .unwrap();
    assert_eq!(supplies.len(), 1);
    let event = &supplies[0];
    assert_eq!(event.role, ContractRole::Pool);
    assert_eq!(event.abi_id, "LendingPool");
    assert_eq!(event.block_hash, block_hash(102, 0));
    let keys: Vec<_> = event.args.as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys.len(), 3);
    assert!(event.args.to_string().contains("500"));
}

#[tokio::test]
async fn restart_resumes_after_checkpoint() {
    let chain = MockChain::new(115, discovery_script());
    let storage = Storage::memory();

    let mut first = builder("base", BASE, &storage, 107)
        .build(Node(chain.clone()))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    assert_eq!(
        first.run(rx).await.unwrap(),
        PipelineExit::Completed { last_block: Some(107) }
    );
    assert_eq!(checkpoint_block(&storage, BASE).await, Some(107));
    drop(first);

    let calls_before = chain.log_calls().len();
    let mut second = builder("base", BASE, &storage, 115)
        .build(Node(chain.clone()))
        .await
        .unwrap();
    // Registry restored from the store, not rediscovered
    assert_eq!(second.processor().watched_addresses().len(), 3);
    assert_eq!(second.processor().checkpoint().resume_block(), 108);

    let (_tx, rx) = no_shutdown();
    assert_eq!(
        second.run(rx).await.unwrap(),
        PipelineExit::Completed { last_block: Some(115) }
    );
    assert_eq!(chain.log_calls()[calls_before].0, 108);
    assert_eq!(
        blocks_of(&storage, BASE, "SupplyLiquidity").await,
        vec![(102, POOL_A), (107, POOL_B), (109, POOL_A)]
    );
}

#[tokio::test]
async fn reorg_rolls_back_discoveries_and_reindexes_the_new_fork() {
    let chain = MockChain::new(
        115,
        vec![
            created(101, 0, POOL_A),
            supply(102, 0, POOL_A, 500),
            created(110, 0, POOL_B).on_fork(0),
            supply(111, 0, POOL_B, 900).on_fork(0),
            created(111, 0, POOL_C).on_fork(1),
            supply(113, 1, POOL_C, 300).on_fork(1),
        ],
    );
    // Blocks 110.. are replaced while block 114 is being fetched
    *chain.fork_trigger.lock().unwrap() = Some((114, 110, 1));

    let storage = Storage::memory();
    let reorgs = Arc::new(ReorgLog::default());
    let mut pipeline = builder("base", BASE, &storage, 115)
        .on_reorg(reorgs.clone())
        .build(Node(chain.clone()))
        .await
        .unwrap();

    let (_tx, rx) = no_shutdown();
    let exit = pipeline.run(rx).await.unwrap();
    assert_eq!(exit, PipelineExit::Completed { last_block: Some(115) });

    let seen = reorgs.0.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].safe_ancestor, 109);
    assert_eq!(seen[0].invalidated_block, 110);
    assert_eq!(seen[0].depth, 4);

    // POOL_B existed only on the abandoned fork
    assert_eq!(
        watched(&storage, BASE).await,
        vec![(POOL_A, 101), (POOL_C, 111), (FACTORY, 100)]
    );
    assert_eq!(
        blocks_of(&storage, BASE, "LendingPoolCreated").await,
        vec![(101, FACTORY), (111, FACTORY)]
    );
    assert_eq!(
        blocks_of(&storage, BASE, "SupplyLiquidity").await,
        vec![(102, POOL_A), (113, POOL_C)]
    );

    let cursor = storage.checkpoints.load(BASE).await.unwrap().unwrap().cursor;
    assert_eq!(cursor.last_processed_block, 115);
    assert_eq!(cursor.block_hash, Some(block_hash(115, 1)));
}

#[tokio::test]
async fn shutdown_stops_at_a_block_boundary() {
    let chain = MockChain::new(115, discovery_script());
    let storage = Storage::memory();
    let (tx, rx) = watch::channel(false);

    let mut pipeline = builder("base", BASE, &storage, 115)
        .on_block(Arc::new(StopAfter {
            block: 102,
            shutdown: tx,
        }))
        .build(Node(chain))
        .await
        .unwrap();

    let exit = pipeline.run(rx).await.unwrap();
    assert_eq!(exit, PipelineExit::Cancelled { last_block: Some(102) });
    assert_eq!(checkpoint_block(&storage, BASE).await, Some(102));
    assert_eq!(
        blocks_of(&storage, BASE, "SupplyLiquidity").await,
        vec![(102, POOL_A)]
    );
}

#[tokio::test]
async fn transient_rpc_failures_are_retried() {
    let chain = MockChain::new(115, discovery_script());
    chain.failing_log_calls.store(2, Ordering::SeqCst);
    let storage = Storage::memory();

    let mut pipeline = builder("base", BASE, &storage, 115)
        .build(Node(chain.clone()))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let exit = pipeline.run(rx).await.unwrap();

    assert_eq!(exit, PipelineExit::Completed { last_block: Some(115) });
    assert_eq!(chain.log_calls()[..3], [(100, 103), (100, 103), (100, 103)]);
    assert_eq!(blocks_of(&storage, BASE, "SupplyLiquidity").await.len(), 3);
}

#[tokio::test]
async fn exhausted_retries_stop_the_chain() {
    let chain = MockChain::new(115, discovery_script());
    chain.failing_log_calls.store(u32::MAX, Ordering::SeqCst);
    let storage = Storage::memory();

    let mut pipeline = builder("base", BASE, &storage, 115)
        .build(Node(chain))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let err = pipeline.run(rx).await.unwrap_err();

    assert!(matches!(err, IndexerError::RetriesExhausted { .. }), "{err}");
    assert_eq!(checkpoint_block(&storage, BASE).await, None);
}

#[tokio::test]
async fn undecodable_factory_log_is_fatal_but_pool_log_is_skipped() {
    let mut script = discovery_script();
    script.push(garbage(102, 1, POOL_A));
    script.push(garbage(103, 0, FACTORY));
    let chain = MockChain::new(115, script);
    let storage = Storage::memory();

    let mut pipeline = builder("base", BASE, &storage, 115)
        .build(Node(chain))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let err = pipeline.run(rx).await.unwrap_err();

    assert!(
        matches!(err, IndexerError::CriticalDecode { address, block_number: 103, .. } if address == FACTORY),
        "{err}"
    );
    // Block 102 completed despite its undecodable pool log; block 103 never did
    assert_eq!(checkpoint_block(&storage, BASE).await, Some(102));
    assert_eq!(
        blocks_of(&storage, BASE, "SupplyLiquidity").await,
        vec![(102, POOL_A)]
    );
}

#[tokio::test]
async fn undecodable_pool_log_is_fatal_when_pools_announce_positions() {
    let chain = MockChain::new(
        115,
        vec![
            created(101, 0, POOL_A),
            supply(102, 0, POOL_A, 500),
            garbage(103, 0, POOL_A),
        ],
    );
    let storage = Storage::memory();

    let mut pipeline = builder("base", BASE, &storage, 115)
        .discovery_rule(position_rule())
        .build(Node(chain))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let err = pipeline.run(rx).await.unwrap_err();

    assert!(
        matches!(err, IndexerError::CriticalDecode { address, block_number: 103, .. } if address == POOL_A),
        "{err}"
    );
    assert_eq!(checkpoint_block(&storage, BASE).await, Some(102));
}

#[tokio::test]
async fn positions_are_discovered_from_pool_events() {
    let chain = MockChain::new(
        110,
        vec![
            created(101, 0, POOL_A),
            create_position(103, 0, POOL_A, POSITION),
            // Same block as the position's creation: not yet visible
            supply(103, 1, POSITION, 1),
            supply(104, 0, POSITION, 42),
        ],
    );
    let storage = Storage::memory();

    let mut pipeline = builder("base", BASE, &storage, 110)
        .discovery_rule(position_rule())
        .build(Node(chain.clone()))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let exit = pipeline.run(rx).await.unwrap();
    assert_eq!(exit, PipelineExit::Completed { last_block: Some(110) });

    assert_eq!(
        watched(&storage, BASE).await,
        vec![(POOL_A, 101), (POSITION, 103), (FACTORY, 100)]
    );
    let position = storage
        .registry
        .load_addresses(BASE)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.address == POSITION)
        .unwrap();
    assert_eq!(position.role, ContractRole::Position);
    assert_eq!(position.abi_id, "Position");

    assert_eq!(
        blocks_of(&storage, BASE, "CreatePosition").await,
        vec![(103, POOL_A)]
    );
    let supplies = storage
        .events
        .events(BASE, Some("SupplyLiquidity"), 10)
        .await
        .unwrap();
    assert_eq!(supplies.len(), 1);
    assert_eq!((supplies[0].block_number, supplies[0].address), (104, POSITION));
    assert_eq!(supplies[0].role, ContractRole::Position);
    assert!(chain.log_calls().contains(&(104, 107)));
}

#[tokio::test]
async fn receipts_are_attached_to_opted_in_contracts() {
    let chain = MockChain::new(110, discovery_script());
    // The node has not indexed the first receipt yet
    chain.missing_receipts.store(1, Ordering::SeqCst);
    let storage = Storage::memory();

    let mut pipeline = builder("base", BASE, &storage, 110)
        .include_receipts("LendingPool")
        .build(Node(chain.clone()))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let exit = pipeline.run(rx).await.unwrap();
    assert_eq!(exit, PipelineExit::Completed { last_block: Some(110) });

    let supplies = storage
        .events
        .events(BASE, Some("SupplyLiquidity"), 10)
        .await
        .unwrap();
    assert_eq!(supplies.len(), 3);
    for event in &supplies {
        let receipt = event.receipt.as_ref().unwrap();
        assert_eq!(Some(receipt.transaction_hash), event.tx_hash);
        assert_eq!(receipt.block_hash, event.block_hash);
        assert_eq!(receipt.block_number, event.block_number);
        assert_eq!(receipt.gas_used, 50_000 + event.block_number);
        assert_eq!(receipt.from, USER);
        assert_eq!(receipt.to, Some(event.address));
        assert!(receipt.status);
    }

    // Factory events are not opted in and cost no receipt lookups
    let created = storage
        .events
        .events(BASE, Some("LendingPoolCreated"), 10)
        .await
        .unwrap();
    assert!(created.iter().all(|e| e.receipt.is_none()));
    let factory_txs: BTreeSet<_> = created.iter().filter_map(|e| e.tx_hash).collect();
    let calls = chain.receipt_calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|tx| !factory_txs.contains(tx)));
}

#[tokio::test]
async fn empty_registry_makes_no_log_requests() {
    let chain = MockChain::new(110, discovery_script());
    let storage = Storage::memory();

    let mut pipeline = IndexerBuilder::new("base", ChainConfig::new(BASE, "http://mock.invalid"))
        .start_block(100)
        .to_block(110)
        .confirmation_depth(0)
        .decoder(abis())
        .backend(&storage)
        .build(Node(chain.clone()))
        .await
        .unwrap();
    let (_tx, rx) = no_shutdown();
    let exit = pipeline.run(rx).await.unwrap();

    assert_eq!(exit, PipelineExit::Completed { last_block: Some(110) });
    assert!(chain.log_calls().is_empty());
    assert_eq!(checkpoint_block(&storage, BASE).await, Some(110));
}

#[tokio::test]
async fn supervisor_isolates_a_failing_chain() {
    let storage = Storage::memory();

    let healthy = builder("base", BASE, &storage, 115)
        .build(Node(MockChain::new(115, discovery_script())))
        .await
        .unwrap();

    let mut broken_script = discovery_script();
    broken_script.push(garbage(103, 0, FACTORY));
    let broken = builder("mainnet", 1, &storage, 115)
        .build(Node(MockChain::new(115, broken_script)))
        .await
        .unwrap();

    let mut supervisor = Supervisor::new();
    supervisor.spawn(healthy);
    supervisor.spawn(broken);
    assert_eq!(supervisor.len(), 2);

    let mut reports = supervisor.join_all().await;
    reports.sort_by(|a, b| a.chain.cmp(&b.chain));
    assert_eq!(reports[0].chain, "base");
    assert!(matches!(
        reports[0].result,
        Ok(PipelineExit::Completed { last_block: Some(115) })
    ));
    assert_eq!(reports[1].chain, "mainnet");
    assert!(matches!(
        reports[1].result,
        Err(IndexerError::CriticalDecode { .. })
    ));

    assert_eq!(checkpoint_block(&storage, BASE).await, Some(115));
    assert_eq!(checkpoint_block(&storage, 1).await, Some(102));
}
