//! Buffer rings shared between one layer writer and many readers.
//!
//! Each layer owns a region holding a [`shm_layout::LayerHeader`] and
//! `buffer_count` slots of sensor responses. Every slot has a named rw-lock:
//! the writer keeps the slot it fills write-locked and swaps to another one
//! it can lock; readers share-lock the slot they read. All regions and locks
//! are created and attached through a [`ResourceRegistry`].

mod predictor;
mod reader;
mod registry;
mod ring;
pub mod shm_layout;
mod writer;

pub use predictor::{PROTECTION_SEED, SwapPredictor, WRITE_ESTIMATE_SEED};
pub use reader::{FrameView, ReadStatus, RingReader};
pub use registry::{ProcessRegistry, RegistryError, ResourceRegistry};
pub use ring::{LayerRing, NAME_PREFIX, RingConfig, layer_region_name, name_char, slot_lock_name};
pub use writer::{RingWriter, SWAP_MARGIN, SlotWriter};
