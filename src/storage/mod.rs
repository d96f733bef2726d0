//! Object storage access for source files.
//!
//! # Overview
//!
//! The storage layer consists of:
//! - **ObjectStore**: read-only access to source objects by [`FileRef`]
//! - **LocalObjectStore**: a directory standing in for one or more buckets
//! - **MemoryObjectStore**: objects held in memory, for tests and dry runs
//! - **decode_csv**: turns a staged CSV file into a [`Frame`]
//!
//! # Usage
//!
//! ```rust,ignore
//! use customer_orders::storage::{decode_csv, LocalObjectStore, ObjectStore};
//! use customer_orders::warehouse::FileRef;
//!
//! let store = LocalObjectStore::new("./object-store", "aws_default");
//! let file = FileRef::new("s3://sanketh-astrosdk/orders_data_header.csv", "aws_default");
//! let bytes = store.read(&file).await?;
//! let frame = decode_csv(&file.path, &bytes)?;
//! ```
//!
//! [`FileRef`]: crate::warehouse::FileRef
//! [`Frame`]: crate::warehouse::Frame

pub mod decode;
pub mod object_store;

pub use decode::decode_csv;
pub use object_store::{object_key, LocalObjectStore, MemoryObjectStore, ObjectStore};
