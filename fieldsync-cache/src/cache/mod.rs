//! Read-through cache with staleness probing and realtime sync.
//!
//! Cached data is never trusted blindly. A slot is served only when one of
//! these holds:
//!
//! - a realtime listener is keeping it current,
//! - it is younger than the caller's `max_age` and no probe was requested,
//! - it is younger than `max_age` and a one-row probe for records modified
//!   after its [`Watermark`] came back empty.
//!
//! Everything else is a full fetch, coalesced per [`QueryKey`] so concurrent
//! callers issue one remote query between them.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheService::with_defaults(store);
//!
//! // Probe-verified read with the default 5 minute window
//! let tasks = cache.get_cached_collection::<Task>("tasks", None, None).await?;
//!
//! // Trust the window alone
//! let tasks = cache
//!     .get_cached_collection::<Task>("tasks", None, Some(ReadOptions::unchecked(ttl)))
//!     .await?;
//!
//! // Inspect where a read came from
//! let read = cache.read_collection::<Task>("tasks", None, None).await?;
//! if read.source() == ReadSource::Remote {
//!     tracing::debug!("refetched");
//! }
//! ```

pub mod flight;
pub mod freshness;
pub mod key;
pub mod probe;
pub mod read_through;
pub mod realtime;
pub mod stats;
pub mod store;
pub mod watermark;

pub use flight::{Flight, FlightTable};
pub use freshness::{CacheRead, ReadSource};
pub use key::{canonical_signature, QueryKey, NO_FILTER_SIGNATURE};
pub use probe::{collection_probe, document_probe, ProbeOutcome, StalenessProber};
pub use read_through::CacheService;
pub use realtime::{ListenerErrorCallback, ListenerHandle, ListenerRegistry};
pub use stats::CacheStats;
pub use store::{CacheData, CacheEntry, CacheStore, EntryOrigin, PullWrite};
pub use watermark::Watermark;
