pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubAdapter;

#[cfg(feature = "backend-tract")]
pub use tract::TractAdapter;
