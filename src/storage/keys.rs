pub const PROGRESS_PREFIX: &str = "progress:";
pub const SESSION_PREFIX: &str = "sessions:";

pub fn progress_key(item_id: &str) -> String {
    format!("{PROGRESS_PREFIX}{item_id}")
}

pub fn session_key(item_id: &str) -> String {
    format!("{SESSION_PREFIX}{item_id}")
}

pub fn learned_items_key() -> &'static str {
    "learnedItems"
}

pub fn active_item_key() -> &'static str {
    "activeItemId"
}

pub fn auto_advance_key() -> &'static str {
    "autoAdvanceEnabled"
}
