pub mod model;
pub mod store;

pub use model::{Actor, Phase, Task, TaskFrontmatter};
pub use store::{CreateTaskRequest, TaskScope, TaskStore, UpdateTaskRequest};
