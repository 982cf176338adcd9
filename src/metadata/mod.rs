//! Series metadata: wire records, the disk cache, and the parallel
//! resolver.

mod cache;
mod record;
mod resolver;

pub use cache::{CacheError, MetadataCache};
pub use record::{MetadataPayload, SeriesRecord};
pub use resolver::{DEFAULT_METADATA_WORKERS, MetadataResolver, ResolverContext};
