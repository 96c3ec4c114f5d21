pub mod cache;
pub mod repository;

pub use cache::ContainerCache;
pub use repository::FindById;
