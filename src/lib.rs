//! StripeFS - A Distributed Striped File Store
//!
//! StripeFS spreads file data over a fleet of storage servers with
//! round-robin block placement and optional replication. It features:
//!
//! - **Block Striping**: Files are cut into fixed-size blocks (default 64KiB)
//!   laid out round-robin over the fleet, with a per-file rotation seed so
//!   hot files do not all start on server zero
//! - **Replication**: Each block can carry extra copies on the servers that
//!   follow its primary in rotation order
//! - **Stream RPC**: A compact little-endian envelope protocol over TCP,
//!   with chunked bulk transfers and inline-or-overflow path encoding
//! - **Session or Stateless Access**: Remote files and directory streams can
//!   be held open across calls or re-resolved per operation
//! - **Nested Partitions**: A server can front a whole inner partition,
//!   re-striping everything it serves through the client surface
//!
//! # Architecture
//!
//! - **Placement** ([`placement`]): The pure block-to-server arithmetic,
//!   its exact inverse, and the stripe walker that splits byte ranges
//! - **Metadata** ([`metadata`]): The per-file record (size, block size,
//!   replication level) living on the file's master server
//! - **Wire Protocol** ([`proto`]): Request/reply message layouts and the
//!   envelope framing
//! - **RPC Layer** ([`rpc`]): Client-side sessions, the control-port
//!   handshake and the stream helpers both sides share
//! - **Server** ([`server`]): The dispatch loops, the disk-backed storage
//!   backend and per-operation statistics
//! - **NFI** ([`nfi`]): The network filesystem interface; one connector per
//!   server, local or remote, behind a single trait
//! - **Client API** ([`api`]): POSIX-like descriptors over a partition
//!
//! # Example
//!
//! ```rust,no_run
//! use stripefs::api::StripeFs;
//! use stripefs::config::PartitionConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PartitionConfig {
//!     name: "scratch".to_string(),
//!     servers: vec![
//!         "tcp://node0:3456/".to_string(),
//!         "tcp://node1:3456/".to_string(),
//!     ],
//!     ..Default::default()
//! };
//! let fs = StripeFs::new(config)?;
//!
//! let fd = fs.create("/results.dat", 0o644).await?;
//! fs.write(fd, b"striped across the fleet").await?;
//! fs.close(fd).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod constants;
pub mod fabric;
pub mod logging;
pub mod metadata;
pub mod nfi;
pub mod placement;
pub mod proto;
pub mod rpc;
pub mod server;
