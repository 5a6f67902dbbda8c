//! API components shipped with the core

mod breakpoints;
mod callbacks;
mod filters;
mod session;

pub use self::breakpoints::BreakApi;
pub use self::callbacks::CallbackApi;
pub use self::filters::FilterApi;
pub use self::session::CoreApi;
