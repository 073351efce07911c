pub mod health;
pub mod presence;
pub mod diagnostics;

pub use health::*;
pub use presence::*;
pub use diagnostics::*;
