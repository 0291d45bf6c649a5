pub mod chat_groups;

pub use chat_groups::ChatGroupService;
