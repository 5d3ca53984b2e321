//! Historical state aggregator.
//!
//! Maintains a set of logical state domains (accounts, storage, code, commitment) and
//! standalone inverted indices as a hybrid of a mutable key-value database tail and an
//! immutable, step-partitioned file archive. Writers append keyed state at monotonically
//! increasing transaction numbers; background jobs freeze fully written steps into segment
//! files, merge neighbors into larger spans and prune the covered range out of the database,
//! while readers keep consistent historical and latest views through [`AggregatorRoTx`].

#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod aggregator;
mod collector;
mod commitment;
pub mod config;
mod domain;
mod error;
mod files;
mod history;
mod inverted_index;
mod merge;
mod prune;
mod shared;
pub mod tables;
mod util;
mod view;

pub use aggregator::{Aggregator, BuildSignal};
pub use commitment::{decode_leaf, KeyRef, COMMITMENT_STATE_KEY};
pub use config::{AggregatorConfig, Dirs};
pub use error::{StateError, StateResult};
pub use files::StepRange;
pub use inverted_index::IdxRangeIter;
pub use prune::{AggregatorPruneStat, DomainPruneStat, InvertedIndexPruneStat};
pub use shared::SharedDomains;
pub use tables::{DomainId, InvertedIdx};
pub use util::{BuildGate, BuildPermit, CancelToken, Progress, ProgressGuard, ProgressSet};
pub use view::{AggregatorRoTx, DomainRoTx, InvertedIndexRoTx};
