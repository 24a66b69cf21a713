//! Concrete generation backends

pub mod hunyuan;
pub mod mock;
pub mod sf3d;

pub use hunyuan::HunyuanBackend;
pub use mock::MockBackend;
pub use sf3d::Sf3dBackend;
