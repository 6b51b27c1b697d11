//! Mock collaborators and fixture builders for memvault tests.
//!
//! Everything here is deterministic: the clock is settable, the embedder is
//! a bag-of-words hash (shared tokens produce overlapping vectors, which is
//! enough signal for recall tests), key servers share a fixture master
//! secret, and the LLM replays canned JSON.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memvault_core::clock::Clock;
use memvault_core::embeddings::{normalize, EmbeddingProvider};
use memvault_core::envelope::{ChallengeSigner, FetchShareRequest, KeyServer};
use memvault_core::llm::LlmProvider;
use memvault_core::records::InMemoryRecordStore;
use memvault_core::types::{KeyServerConfig, KeyServerMode, MemvaultConfig};
use memvault_core::wallet::MemoryWallet;
use memvault_storage_memory::InMemoryBlobStore;

type HmacSha256 = Hmac<Sha256>;

/// Settable wall clock.
pub struct MockClock {
    now_ms: AtomicI64,
}

impl MockClock {
    #[must_use]
    pub fn at(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Deterministic signer; can be switched off to simulate a wallet that
/// refuses the challenge.
pub struct MockSigner {
    key: Vec<u8>,
    pub fail: AtomicBool,
}

impl MockSigner {
    #[must_use]
    pub fn new(key: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_vec(),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ChallengeSigner for MockSigner {
    async fn sign(&self, message: &[u8]) -> anyhow::Result<Vec<u8>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("signer refused");
        }
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("any key length");
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Key server sharing a fixture master secret with its peers.
///
/// Set `corrupt` to make it return garbage shares (quorum-disagreement
/// tests) or `down` to make it unreachable.
pub struct MockKeyServer {
    id: String,
    master_secret: Vec<u8>,
    pub corrupt: AtomicBool,
    pub down: AtomicBool,
}

impl MockKeyServer {
    #[must_use]
    pub fn new(id: &str, master_secret: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            master_secret: master_secret.to_vec(),
            corrupt: AtomicBool::new(false),
            down: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl KeyServer for MockKeyServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_share(&self, request: &FetchShareRequest) -> anyhow::Result<Vec<u8>> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("server {} is down", self.id);
        }
        let mut mac =
            HmacSha256::new_from_slice(&self.master_secret).expect("any key length");
        mac.update(&request.identity_bytes);
        let mut share = mac.finalize().into_bytes().to_vec();
        if self.corrupt.load(Ordering::SeqCst) {
            for byte in &mut share {
                *byte = byte.wrapping_add(1);
            }
        }
        Ok(share)
    }
}

/// Scripted LLM: serves the classifier and extractor prompts from canned
/// JSON, with permissive defaults.
pub struct MockLlm {
    pub fail: AtomicBool,
    classify_replies: Mutex<HashMap<String, String>>,
    extract_replies: Mutex<HashMap<String, String>>,
    default_category: Mutex<String>,
}

impl MockLlm {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            classify_replies: Mutex::new(HashMap::new()),
            extract_replies: Mutex::new(HashMap::new()),
            default_category: Mutex::new("personal".to_string()),
        })
    }

    /// Canned classifier reply (raw JSON) for an exact utterance.
    pub fn script_classification(&self, utterance: &str, reply_json: &str) {
        self.classify_replies
            .lock()
            .insert(utterance.to_string(), reply_json.to_string());
    }

    /// Canned extraction reply (raw JSON) for an exact utterance.
    pub fn script_extraction(&self, utterance: &str, reply_json: &str) {
        self.extract_replies
            .lock()
            .insert(utterance.to_string(), reply_json.to_string());
    }

    pub fn set_default_category(&self, category: &str) {
        *self.default_category.lock() = category.to_string();
    }

    fn utterance_of(prompt: &str) -> &str {
        prompt
            .rsplit("Utterance:\n")
            .next()
            .unwrap_or(prompt)
            .trim()
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("LLM overloaded");
        }
        let utterance = Self::utterance_of(prompt);
        if prompt.starts_with("Decide whether the utterance") {
            if let Some(reply) = self.classify_replies.lock().get(utterance) {
                return Ok(reply.clone());
            }
            // Default: utterances prefixed "skip:" are chatter, the rest is
            // worth saving.
            if utterance.starts_with("skip:") {
                return Ok(
                    r#"{"should_save":false,"category":"other","confidence":0.2}"#.to_string()
                );
            }
            let category = self.default_category.lock().clone();
            return Ok(format!(
                r#"{{"should_save":true,"category":"{category}","confidence":0.9}}"#
            ));
        }
        if prompt.starts_with("Extract entities") {
            if let Some(reply) = self.extract_replies.lock().get(utterance) {
                return Ok(reply.clone());
            }
            return Ok(r#"{"nodes":[],"edges":[]}"#.to_string());
        }
        anyhow::bail!("unscripted prompt: {}", &prompt[..prompt.len().min(60)]);
    }
}

/// Bag-of-words embedder: each token is hashed into one of `dimension`
/// buckets. Texts sharing tokens get overlapping (cosine-similar) vectors,
/// which stands in for semantic similarity in tests.
pub struct BagOfWordsEmbedder {
    dimension: usize,
}

impl BagOfWordsEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (hash % self.dimension as u64) as usize
    }
}

#[async_trait]
impl EmbeddingProvider for BagOfWordsEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(token)] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        "bag-of-words-test"
    }
}

/// Everything a scenario test needs, with handles kept for fault
/// injection and restarts.
pub struct TestHarness {
    pub wallet: MemoryWallet,
    pub store: Arc<InMemoryBlobStore>,
    pub records: Arc<InMemoryRecordStore>,
    pub llm: Arc<MockLlm>,
    pub clock: Arc<MockClock>,
    pub signer: Arc<MockSigner>,
    pub servers: Vec<Arc<MockKeyServer>>,
    config: MemvaultConfig,
}

/// Fixture master secret shared by the mock key servers.
pub const MASTER_SECRET: &[u8] = b"memvault-test-master-secret";

/// Config tuned for tests: tiny batch ages, low similarity threshold.
#[must_use]
pub fn fast_config() -> MemvaultConfig {
    let mut config = MemvaultConfig::default();
    config.embedding.batch_age = Duration::from_millis(20);
    config.embedding.batch_size = 4;
    config.index.batch_age = Duration::from_millis(20);
    config.index.batch_size = 8;
    config.index.snapshot_idle = Duration::from_secs(3600);
    config.retrieval.threshold = 0.05;
    config
}

/// Build a harness over fresh state.
#[must_use]
pub fn harness() -> TestHarness {
    harness_with(fast_config())
}

/// Build a harness with a custom config.
#[must_use]
pub fn harness_with(config: MemvaultConfig) -> TestHarness {
    let clock = MockClock::at(1_700_000_000_000);
    let store = Arc::new(InMemoryBlobStore::with_clock(clock.clone()));
    let records = Arc::new(InMemoryRecordStore::new());
    let llm = MockLlm::new();
    let signer = MockSigner::new(b"fixture-signing-key");
    let servers: Vec<Arc<MockKeyServer>> = (1..=3)
        .map(|i| MockKeyServer::new(&format!("ks{i}"), MASTER_SECRET))
        .collect();

    let wallet = build_wallet(
        &config, &store, &records, &llm, &signer, &servers, &clock,
    );
    TestHarness {
        wallet,
        store,
        records,
        llm,
        clock,
        signer,
        servers,
        config,
    }
}

impl TestHarness {
    /// Simulate a process restart: a fresh wallet over the same blob store,
    /// record table, clock and collaborators. Warm state is lost.
    #[must_use]
    pub fn restart(&self) -> TestHarness {
        let wallet = build_wallet(
            &self.config,
            &self.store,
            &self.records,
            &self.llm,
            &self.signer,
            &self.servers,
            &self.clock,
        );
        TestHarness {
            wallet,
            store: self.store.clone(),
            records: self.records.clone(),
            llm: self.llm.clone(),
            clock: self.clock.clone(),
            signer: self.signer.clone(),
            servers: self.servers.clone(),
            config: self.config.clone(),
        }
    }
}

fn build_wallet(
    config: &MemvaultConfig,
    store: &Arc<InMemoryBlobStore>,
    records: &Arc<InMemoryRecordStore>,
    llm: &Arc<MockLlm>,
    signer: &Arc<MockSigner>,
    servers: &[Arc<MockKeyServer>],
    clock: &Arc<MockClock>,
) -> MemoryWallet {
    let mut builder = MemoryWallet::builder(config.clone())
        .blob_store(store.clone())
        .record_store(records.clone())
        .llm(llm.clone())
        .signer(signer.clone())
        .embedder(Arc::new(BagOfWordsEmbedder::new(256)))
        .clock(clock.clone());
    for (i, server) in servers.iter().enumerate() {
        builder = builder.key_server(
            KeyServerConfig {
                object_id: format!("ks{}", i + 1),
                url: format!("https://ks{}.test", i + 1),
                weight: 1,
                mode: KeyServerMode::Open,
            },
            server.clone(),
        );
    }
    builder.build().expect("test wallet wiring")
}
