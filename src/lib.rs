//! # cqf
//!
//! A mergeable, counting quotient filter: a compact approximate multiset
//! supporting insertion, deletion, point-counting, merging, similarity, and
//! file persistence.
//!
//! A counting quotient filter (CQF) stores `(key, value, count)` triples in
//! a fixed-size array of slots, split into fixed-size blocks with two
//! per-block bitmaps (`occupieds`, `runends`) tracking which slots hold the
//! start of a hashed key's run and which hold a run's end. Each key hashes
//! to a quotient (the home slot) and a remainder (the slot payload); runs of
//! slots with the same home are kept sorted by packed `(value, remainder)`
//! so that lookup, insertion, and deletion are a linear scan bounded by the
//! local cluster size rather than the whole filter.
//!
//! ## References
//!
//!  - [A General-Purpose Counting Filter: Making Every Bit Count](https://www.cs.cmu.edu/~dga/papers/debruijn-squared-camera-ready.pdf)
//!  > Pandey, Prashant, Michael A. Bender, Rob Johnson, and Rob Patro. 2017. “A General-Purpose Counting Filter: Making Every Bit Count.” In *Proceedings of the 2017 ACM International Conference on Management of Data*, 775–787. SIGMOD ’17.
//!  - [Don't Thrash: How to Cache Your Hash on Flash](http://www.vldb.org/pvldb/vol10/p1369-bender.pdf)
//!  > Bender, Michael A., Martin Farach-Colton, Rob Johnson, Russell Kraner, Bradley C. Kuszmaul, Dzejla Medjedovic, Pablo Montes, Pradeep Shetty, Richard P. Spillane, and Erez Zadok. 2012. “Don’t Thrash: How to Cache Your Hash on Flash.” *Proc. VLDB Endow.* 5 (11). VLDB Endowment: 1627–37.
//!
//! ## Usage
//!
//! ```
//! use cqf::{CountingQuotientFilter, QfConfig};
//!
//! let mut qf = CountingQuotientFilter::new(QfConfig::new(1 << 16, 32, 0)).unwrap();
//! qf.insert(42, 0, 1).unwrap();
//! assert_eq!(qf.query(42), Some((0, 1)));
//! ```

#![warn(missing_docs)]

extern crate byteorder;
extern crate memmap2;
extern crate rand;
extern crate siphasher;
extern crate thiserror;
extern crate tracing;
#[cfg(feature = "serde")]
extern crate serde_crate as serde;

mod bitutil;
mod block;
pub mod counter;
mod error;
mod hash;
pub mod layout;
mod lock;

pub mod filter;
pub mod merge;
pub mod persist;
pub mod similarity;
mod storage;

pub use crate::error::{CqfError, Result};
pub use crate::filter::{CountingQuotientFilter, QfIter};
pub use crate::layout::{Header, HashMode, LockMode, QfConfig};
pub use crate::merge::{merge, multi_merge};
pub use crate::persist::{serialize, usefile};
pub use crate::similarity::{inner_product, magnitude};
