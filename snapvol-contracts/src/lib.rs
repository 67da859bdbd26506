// SPDX-License-Identifier: GPL-3.0-only

pub mod protocol;
pub mod traits;

pub use protocol::{SourceError, SourceErrorKind};
pub use traits::{BlockSource, SnapshotApi};
