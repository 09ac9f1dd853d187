pub(super) fn default_log_filter() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "json".to_string()
}

pub(super) fn default_tcp_backlog() -> i32 {
    1024
}

pub(super) fn default_retry_attempts() -> usize {
    3
}
