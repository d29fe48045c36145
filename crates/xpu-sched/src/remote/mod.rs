//! Software remote cores
//!
//! Stand-ins for the firmware on the accelerator's control cores, used when
//! no hardware is attached and by every test.

mod firmware;
mod run;

pub use firmware::SoftwareCore;
pub use run::SlotRun;
