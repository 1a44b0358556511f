//! Boundary to the decompiler integration.
//!
//! The adapter pushes edits in through [`crate::client::SyncClient`] and
//! receives merged views back through [`Adapter`]. The core keeps no
//! decompiler state of its own.

use crate::error::Result;
use crate::view::MergedView;

/// Receiver of merged views, driven by the scheduler.
pub trait Adapter: Send {
    /// Apply `view` to the decompiler's database.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the scheduler logs the error and keeps going.
    fn apply_view(&mut self, view: &MergedView) -> Result<()>;
}

impl<F> Adapter for F
where
    F: FnMut(&MergedView) -> Result<()> + Send,
{
    fn apply_view(&mut self, view: &MergedView) -> Result<()> {
        self(view)
    }
}
