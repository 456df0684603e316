//! Shared utility functions
//!
//! UTF-8 safe truncation for parse warning excerpts and history summaries,
//! and a liveness check for processes recorded as plan runners.

/// Safely truncate a string to max_chars characters (not bytes)
/// Avoids panic on multi-byte UTF-8 characters
///
/// # Examples
/// ```
/// use ai_ops::utils::truncate_str;
///
/// assert_eq!(truncate_str("hello world", 5), "hello");
///
/// let emoji = "hello 🌍 world";
/// let truncated = truncate_str(emoji, 7); // "hello 🌍"
/// assert!(truncated.chars().count() <= 7);
/// ```
#[inline]
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    if s.chars().count() <= max_chars {
        s
    } else {
        let byte_idx = s
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(s.len());
        &s[..byte_idx]
    }
}

/// Truncate to `max_chars` characters, appending an explicit marker that
/// states how much was omitted. Returns the input unchanged when it fits.
pub fn truncate_with_marker(s: &str, max_chars: usize) -> String {
    let total = s.chars().count();
    if total <= max_chars {
        return s.to_string();
    }

    let kept = truncate_str(s, max_chars);
    format!(
        "{}\n[Output truncated: {} chars total, showing first {}]",
        kept, total, max_chars
    )
}

/// Whether a process with this pid exists on this host
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    // EPERM: it exists but belongs to someone else
    matches!(kill(Pid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
