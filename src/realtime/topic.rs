//! Topic naming.
//!
//! Table topics are `table/<name>/<project_id>` and chat topics are
//! `chat/<room_id>/<project_id>`. A table name that already contains a `/` is taken
//! to be a fully-qualified topic and used verbatim.

/// Separator between topic segments.
pub const SEPARATOR: char = '/';

/// Fully-qualified topic for a table.
#[must_use]
pub fn table(name: &str, project_id: &str) -> String {
    if name.contains(SEPARATOR) {
        name.to_owned()
    } else {
        format!("table/{name}/{project_id}")
    }
}

/// Fully-qualified topic for a chat room.
#[must_use]
pub fn chat(room_id: &str, project_id: &str) -> String {
    format!("chat/{room_id}/{project_id}")
}
