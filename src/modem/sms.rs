//! SMS helpers: contact number normalization, character set choice and message
//! segmentation.

/// Characters per single GSM 7-bit message.
pub const SMS_MAX_CHARS: usize = 160;
/// UTF-16 code units per single UCS2 message.
pub const UCS2_MAX_UNITS: usize = 70;
/// Room left in every part for the `[i/n] ` prefix.
const PART_PREFIX_RESERVE: usize = 10;

/// Character set a message is submitted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmsEncoding {
    /// GSM 7-bit default alphabet (`AT+CSCS="GSM"`).
    Gsm7,
    /// UTF-16 as hex quads (`AT+CSCS="UCS2"`), for text outside the GSM alphabet.
    Ucs2,
}

impl SmsEncoding {
    /// GSM 7-bit only when every character has the same code in ASCII and the GSM alphabet;
    /// anything else (emoji, accents, `@`, `$`, `_`) goes out as UCS2.
    pub fn for_text(text: &str) -> Self {
        if text.chars().all(is_gsm_safe) {
            SmsEncoding::Gsm7
        } else {
            SmsEncoding::Ucs2
        }
    }

    /// Value for `AT+CSCS`.
    pub fn charset(self) -> &'static str {
        match self {
            SmsEncoding::Gsm7 => "GSM",
            SmsEncoding::Ucs2 => "UCS2",
        }
    }

    /// TP-DCS value for `AT+CSMP`.
    pub fn data_coding_scheme(self) -> u8 {
        match self {
            SmsEncoding::Gsm7 => 0,
            SmsEncoding::Ucs2 => 8,
        }
    }

    pub fn max_units(self) -> usize {
        match self {
            SmsEncoding::Gsm7 => SMS_MAX_CHARS,
            SmsEncoding::Ucs2 => UCS2_MAX_UNITS,
        }
    }

    fn char_units(self, c: char) -> usize {
        match self {
            SmsEncoding::Gsm7 => 1,
            SmsEncoding::Ucs2 => c.len_utf16(),
        }
    }

    /// Length of `text` in this encoding's units.
    pub fn units(self, text: &str) -> usize {
        text.chars().map(|c| self.char_units(c)).sum()
    }

    /// `text` as the modem expects it after `AT+CSCS` selected this character set. Applies
    /// to the destination number as well as the message text.
    pub fn encode(self, text: &str) -> String {
        match self {
            SmsEncoding::Gsm7 => text.to_string(),
            SmsEncoding::Ucs2 => text.encode_utf16().map(|u| format!("{:04X}", u)).collect(),
        }
    }
}

fn is_gsm_safe(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, ' ' | '\n' | '\r')
        || "!\"#%&'()*+,-./:;<=>?".contains(c)
}

/// Strips formatting from a phone number and checks its shape.
///
/// International numbers are `+` followed by 7 to 15 digits; local numbers are 10 or 11
/// digits. Returns the cleaned number, or `None` if it is not dialable.
pub fn normalize_number(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let international = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if trimmed.chars().skip(1).any(|c| c == '+') {
        return None;
    }
    if international {
        (7..=15)
            .contains(&digits.len())
            .then(|| format!("+{}", digits))
    } else {
        (10..=11).contains(&digits.len()).then_some(digits)
    }
}

/// Splits `body` into SMS parts in the encoding it needs.
pub fn split_message(body: &str) -> Vec<String> {
    split_message_as(body, SmsEncoding::for_text(body))
}

/// Splits `body` into SMS parts for `encoding`.
///
/// A body that fits one message (160 GSM characters, 70 UCS2 units) is sent as is. Longer
/// bodies are broken on whitespace into parts that leave room for an `[i/n] ` prefix. Line
/// breaks inside a part are preserved; words longer than a part are cut.
pub fn split_message_as(body: &str, encoding: SmsEncoding) -> Vec<String> {
    if encoding.units(body) <= encoding.max_units() {
        return vec![body.to_string()];
    }
    let budget = encoding.max_units() - PART_PREFIX_RESERVE;

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for token in body.split_inclusive(char::is_whitespace) {
        let token_len = encoding.units(token);
        let word = token.trim_end();
        let word_len = encoding.units(word);
        if current_len + word_len > budget && current_len > 0 {
            parts.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        if word_len > budget {
            for c in word.chars() {
                let width = encoding.char_units(c);
                if current_len + width > budget {
                    parts.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(c);
                current_len += width;
            }
            current.push(' ');
            current_len += 1;
            continue;
        }
        current.push_str(token);
        current_len += token_len;
    }
    let tail = current.trim_end();
    if !tail.is_empty() {
        parts.push(tail.to_string());
    }

    let total = parts.len();
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| format!("[{}/{}] {}", i + 1, total, part))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_international_and_local_numbers() {
        assert_eq!(
            normalize_number("+63 917-123-4567").as_deref(),
            Some("+639171234567")
        );
        assert_eq!(normalize_number("(0917) 123 4567").as_deref(), Some("09171234567"));
        assert_eq!(normalize_number("+1234567").as_deref(), Some("+1234567"));
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert_eq!(normalize_number(""), None);
        assert_eq!(normalize_number("12345"), None);
        assert_eq!(normalize_number("+123456"), None);
        assert_eq!(normalize_number("+1234567890123456"), None);
        assert_eq!(normalize_number("091712345678"), None);
        assert_eq!(normalize_number("+63+9171234567"), None);
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hello"), vec!["hello".to_string()]);
        let exact = "x".repeat(SMS_MAX_CHARS);
        assert_eq!(split_message(&exact), vec![exact.clone()]);
    }

    #[test]
    fn long_messages_split_on_word_boundaries() {
        let body = "word ".repeat(70);
        let parts = split_message(body.trim_end());
        assert_eq!(parts.len(), 3);
        for (i, part) in parts.iter().enumerate() {
            assert!(part.starts_with(&format!("[{}/3] ", i + 1)));
            assert!(part.chars().count() <= SMS_MAX_CHARS);
            assert!(!part.ends_with(' '));
            assert!(part.split(' ').skip(1).all(|w| w == "word"));
        }
    }

    #[test]
    fn overlong_words_are_cut() {
        let body = format!("start {} end", "y".repeat(200));
        let parts = split_message(&body);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "[1/3] start");
        assert_eq!(parts[1], format!("[2/3] {}", "y".repeat(150)));
        assert_eq!(parts[2], format!("[3/3] {} end", "y".repeat(50)));
    }

    #[test]
    fn splitting_keeps_every_character() {
        let body = "line one\nline two ".repeat(20);
        let parts = split_message(&body);
        let rejoined: String = parts
            .iter()
            .map(|p| p.split_once("] ").map(|(_, rest)| rest).unwrap_or(p))
            .collect::<Vec<_>>()
            .join(" ");
        let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(squash(&rejoined), squash(&body));
    }

    #[test]
    fn encoding_follows_the_text() {
        assert_eq!(SmsEncoding::for_text("Evacuate to: Gym, 3 people"), SmsEncoding::Gsm7);
        assert_eq!(SmsEncoding::for_text("🚨 ALERT"), SmsEncoding::Ucs2);
        assert_eq!(SmsEncoding::for_text("reach me @ home"), SmsEncoding::Ucs2);
        assert_eq!(SmsEncoding::Ucs2.encode("A🚨"), "0041D83DDEA8");
        assert_eq!(SmsEncoding::Ucs2.encode("+63"), "002B00360033");
        assert_eq!(SmsEncoding::Gsm7.encode("+63"), "+63");
    }

    #[test]
    fn ucs2_parts_fit_seventy_units() {
        let body = format!("🚨 DISASTER RESPONSE ALERT 🚨\n{}", "Detected: 3 people ".repeat(8));
        let parts = split_message(&body);
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(SmsEncoding::Ucs2.units(part) <= UCS2_MAX_UNITS, "{}", part);
        }
        assert!(parts[0].starts_with(&format!("[1/{}] 🚨", parts.len())));

        let short = "🚨 test";
        assert_eq!(split_message(short), vec![short.to_string()]);
    }
}
