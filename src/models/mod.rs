pub mod enums;

mod caregiver;
mod event;
mod history;
mod medication;
mod occurrence;
mod pillbox;
mod schedule;
mod user;

pub use caregiver::*;
pub use event::*;
pub use history::*;
pub use medication::*;
pub use occurrence::*;
pub use pillbox::*;
pub use schedule::*;
pub use user::*;
