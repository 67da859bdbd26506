// SPDX-License-Identifier: GPL-3.0-only

pub mod block_source;
pub mod snapshot;

pub use block_source::BlockSource;
pub use snapshot::SnapshotApi;
