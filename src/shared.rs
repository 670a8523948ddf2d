//! Driver shared between the polling loop and the LCD interrupt handler.
//!
//! ```ignore
//! static DISPLAY: SharedDisplay<Lcd> = SharedDisplay::new();
//!
//! #[handler]
//! fn lcd_cam() {
//!     DISPLAY.on_interrupt();
//! }
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use log::warn;

use crate::{
    display::{DriverState, RgbDisplay},
    error::Error,
    hal::LcdPeripheral,
};

pub struct SharedDisplay<P: LcdPeripheral> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Option<RgbDisplay<P>>>>,
}

impl<P: LcdPeripheral> Default for SharedDisplay<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LcdPeripheral> SharedDisplay<P> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Move `display` in. Hands it back if a display is already installed.
    pub fn install(&self, display: RgbDisplay<P>) -> Result<(), RgbDisplay<P>> {
        self.inner.lock(|cell| match cell.try_borrow_mut() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(display);
                Ok(())
            }
            _ => Err(display),
        })
    }

    /// Move the display back out.
    pub fn take(&self) -> Option<RgbDisplay<P>> {
        self.inner
            .lock(|cell| cell.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
    }

    /// Run `f` on the display inside a critical section. `None` if no
    /// display is installed or it is already borrowed further up the stack.
    pub fn with<R>(&self, f: impl FnOnce(&mut RgbDisplay<P>) -> R) -> Option<R> {
        self.inner.lock(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            slot.as_mut().map(f)
        })
    }

    /// Service LCD events from the interrupt handler.
    pub fn on_interrupt(&self) -> bool {
        self.with(|display| display.handle_interrupt())
            .unwrap_or(false)
    }

    pub fn update(&self) -> Result<(), Error> {
        self.with(|display| display.update()).unwrap_or_else(|| {
            warn!("Display update requested, but no display installed");
            Err(Error::InvalidState {
                state: DriverState::Uninitialized,
                operation: "update",
            })
        })
    }
}
