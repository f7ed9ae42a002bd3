//! Hard caps on stored documents and runner input.

pub const MAX_ID_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 1024;
pub const MAX_DATE_LEN: usize = 64;
pub const MAX_DEPENDENCIES_PER_ITEM: usize = 1_000;
pub const MAX_RESOURCES_PER_ITEM: usize = 256;
pub const MAX_ITEMS_PER_PROJECT: usize = 50_000;
pub const MAX_PROJECTS: usize = 100_000;

/// Longest accepted line on the runner's event stream (1 MiB).
pub const MAX_EVENT_LINE_LEN: usize = 1 << 20;
