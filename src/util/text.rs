/// Cut `s` to at most `max_len` bytes on a char boundary, marking the cut
/// with `…`. Used for upstream bodies that end up in logs and errors.
pub fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = truncate_for_log("ñañaña".to_string(), 3);
        assert!(s.ends_with('…'));
        assert!(s.starts_with('ñ'));
        assert_eq!(truncate_for_log("short".to_string(), 10), "short");
    }
}
