pub mod diagnostics;
pub mod health;
pub mod messages;

pub use diagnostics::*;
pub use health::*;
pub use messages::*;
