#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Memvault Core
//!
//! A personal-memory substrate for language-model applications. Conversational
//! utterances are classified, embedded, encrypted under identity strings,
//! stored content-addressed, and indexed into per-user vector and knowledge
//! graph structures. Retrieval unifies vector similarity, keyword, graph
//! proximity and temporal filters, with identity-scoped permission checks and
//! automatic decryption.
//!
//! ## Core Concepts
//!
//! - **Memories**: atomic units owned by a wallet address, with a category,
//!   importance, tags, an encrypted content blob and index references
//! - **Identities**: structured IBE identity strings (`self`, `app`, `time`,
//!   `role`, `cond`) that name the key a ciphertext is sealed under
//! - **Warm indices**: per-user HNSW indices and knowledge graphs, mutated in
//!   memory and periodically snapshotted to the blob store
//! - **Consent grants**: identity-scoped permissions gating cross-app reads
//!
//! ## Module Organization
//!
//! ### Primary APIs
//! - [`wallet`]: the [`MemoryWallet`](wallet::MemoryWallet) owner-coordinator
//!   and its control surface (ingest, search, grants, rotation, flush)
//! - [`pipeline`]: the ingestion pipeline with at-most-once semantics
//! - [`retrieval`]: hybrid retrieval engine
//! - [`envelope`]: identity-based encryption envelope and session keys
//!
//! ### Infrastructure
//! - [`blob`]: content-addressed blob store abstraction
//! - [`cache`]: three-tier content cache
//! - [`batcher`]: generic size+time batch scheduler
//! - [`index`]: per-user approximate-nearest-neighbor index lifecycle
//! - [`graph`]: per-user knowledge graph
//! - [`embeddings`]: text-to-vector providers with memoisation
//! - [`permission`]: consent grants and the permission predicate
//!
//! ## Quick Start
//!
//! ```no_run
//! use memvault_core::wallet::MemoryWallet;
//! use memvault_core::types::UserAddress;
//!
//! # async fn example(wallet: MemoryWallet) -> memvault_core::Result<()> {
//! let user = UserAddress::new("0x6f1d...a2");
//!
//! // Ingest an utterance; classification decides whether it is kept.
//! let outcome = wallet.ingest(&user, "My dog's name is Pepper", None).await?;
//!
//! // Retrieve it back by meaning.
//! let results = wallet
//!     .search(&user, "what is my dog called?", Default::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod blob;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod constants;
pub mod embeddings;
pub mod envelope;
pub mod error;
pub mod events;
pub mod graph;
pub mod identity;
pub mod index;
pub mod llm;
pub mod permission;
pub mod pipeline;
pub mod records;
pub mod retrieval;
pub mod retry;
pub mod types;
pub mod wallet;

// Re-export commonly used types
pub use blob::{BlobStore, BlobTags, PutReceipt};
pub use clock::{Clock, SystemClock};
pub use embeddings::{EmbeddingProvider, EmbeddingService, HashEmbedder};
pub use envelope::{ChallengeSigner, KeyServer, SealEnvelope};
pub use error::{Error, Result};
pub use events::WalletEvent;
pub use identity::IbeIdentity;
pub use llm::LlmProvider;
pub use permission::{ConsentGrant, PermissionPredicate, Scope};
pub use types::{
    Category, EncryptionDescriptor, IngestOutcome, MemoryId, MemoryRecord, MemvaultConfig,
    UserAddress,
};
pub use wallet::{MemoryWallet, MemoryWalletBuilder, WalletStats};
