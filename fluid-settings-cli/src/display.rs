//! Terminal rendering of setting values.
//!
//! Values may carry control characters that would mangle the terminal.
//! C0 controls render in caret notation (`^A`), DEL as `^?`, C1 controls
//! in `@`-notation (`@A`). A replacement character in the value means the
//! original bytes were not valid UTF-8 (lone surrogates included); the
//! value still renders but the operation is reported as failed.

/// Render a value for the terminal. Returns the rendered string and
/// whether the value was sound (no mangled encoding).
pub fn render_value(value: &str) -> (String, bool) {
    let mut out = String::with_capacity(value.len());
    let mut clean = true;
    for c in value.chars() {
        match c {
            '\u{7f}' => out.push_str("^?"),
            c if (c as u32) < 0x20 => {
                out.push('^');
                out.push(char::from_u32(c as u32 + 0x40).unwrap_or('?'));
            }
            c if (0x80..=0x9f).contains(&(c as u32)) => {
                out.push('@');
                out.push(char::from_u32(c as u32 - 0x40).unwrap_or('?'));
            }
            '\u{fffd}' => {
                clean = false;
                out.push(c);
            }
            c => out.push(c),
        }
    }
    (out, clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_untouched() {
        let (rendered, clean) = render_value("hello world");
        assert_eq!(rendered, "hello world");
        assert!(clean);
    }

    #[test]
    fn c0_controls_use_caret_notation() {
        let (rendered, clean) = render_value("a\u{01}b\nc");
        assert_eq!(rendered, "a^Ab^Jc");
        assert!(clean);
    }

    #[test]
    fn del_renders_as_caret_question() {
        let (rendered, _) = render_value("x\u{7f}y");
        assert_eq!(rendered, "x^?y");
    }

    #[test]
    fn c1_controls_use_at_notation() {
        let (rendered, clean) = render_value("a\u{85}b");
        assert_eq!(rendered, "a@Eb");
        assert!(clean);
    }

    #[test]
    fn replacement_character_marks_failure() {
        let (rendered, clean) = render_value("bad\u{fffd}bytes");
        assert_eq!(rendered, "bad\u{fffd}bytes");
        assert!(!clean);
    }
}
