pub mod apiserver;
pub mod syncrequest;

pub use apiserver::*;
pub use syncrequest::*;
