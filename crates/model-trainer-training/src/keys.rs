//! Shared state store key layout.

#[must_use]
pub fn run_status(run_id: &str) -> String {
    format!("runs:status:{run_id}")
}

#[must_use]
pub fn run_heartbeat(run_id: &str) -> String {
    format!("runs:hb:{run_id}")
}

#[must_use]
pub fn run_message(run_id: &str) -> String {
    format!("runs:msg:{run_id}")
}

#[must_use]
pub fn run_cancelled(run_id: &str) -> String {
    format!("runs:{run_id}:cancelled")
}

#[must_use]
pub fn run_eval(run_id: &str) -> String {
    format!("runs:eval:{run_id}")
}

#[must_use]
pub fn artifact_file_id(run_id: &str) -> String {
    format!("runs:artifact:{run_id}:file_id")
}

#[must_use]
pub fn tokenizer_status(tokenizer_id: &str) -> String {
    format!("tokenizer:{tokenizer_id}:status")
}

#[must_use]
pub fn tokenizer_stats(tokenizer_id: &str) -> String {
    format!("tokenizer:{tokenizer_id}:stats")
}
