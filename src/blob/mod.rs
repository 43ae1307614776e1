//! S3-compatible object store adapter standing in for the excluded blob-store
//! collaborator (buckets, object get/put/list/delete, bucket policy,
//! presigned GET). See [`client`] for the adapter and [`sign`] for the
//! SigV4 signing it's built on.

mod client;
mod sign;

pub use client::{BlobError, BlobResult, BlobStore};
