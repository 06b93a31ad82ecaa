//! Minimal vCard 3.0 / 4.0 parser
//!
//! Covers the properties the sync engine interprets: UID, FN, N, EMAIL,
//! KIND, MEMBER, and the Apple `X-ADDRESSBOOKSERVER-*` extensions iCloud
//! uses for vCard3 groups. Everything else passes through untouched so
//! serialization is loss-free for unmodified cards.

const X_VCARD3_KIND: &str = "X-ADDRESSBOOKSERVER-KIND";
const X_VCARD3_MEMBER: &str = "X-ADDRESSBOOKSERVER-MEMBER";
const FOLD_WIDTH: usize = 75;

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub group: String,
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl Property {
    fn serialize(&self) -> String {
        let mut line = String::new();
        if !self.group.is_empty() {
            line.push_str(&self.group);
            line.push('.');
        }
        line.push_str(&self.name);
        for (key, value) in &self.params {
            line.push(';');
            line.push_str(key);
            if !value.is_empty() {
                line.push('=');
                line.push_str(value);
            }
        }
        line.push(':');
        line.push_str(&self.value);
        fold(&line)
    }
}

/// RFC 6350 §3.2 line folding at 75 octets.
fn fold(line: &str) -> String {
    if line.len() <= FOLD_WIDTH {
        return line.to_string();
    }
    let mut out = String::with_capacity(line.len() + line.len() / FOLD_WIDTH * 3);
    let mut count = 0;
    for c in line.chars() {
        if count + c.len_utf8() > FOLD_WIDTH {
            out.push_str("\r\n ");
            count = 1; // the leading space
        }
        out.push(c);
        count += c.len_utf8();
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct VCard {
    pub properties: Vec<Property>,
    complete: bool,
}

impl VCard {
    /// Parse a card, unfolding continuation lines first. A card missing
    /// its BEGIN/END envelope is marked incomplete.
    pub fn parse(text: &str) -> VCard {
        let mut unfolded: Vec<String> = Vec::new();
        for raw_line in text.split("\r\n").flat_map(|l| l.split('\n')) {
            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = unfolded.last_mut() {
                    last.push_str(&line[1..]);
                    continue;
                }
            }
            if !line.is_empty() {
                unfolded.push(line.to_string());
            }
        }

        let mut card = VCard::default();
        let mut saw_begin = false;
        let mut saw_end = false;
        for line in unfolded {
            let Some(colon) = find_unquoted_colon(&line) else {
                continue;
            };
            let (head, value) = line.split_at(colon);
            let value = value[1..].to_string();

            let mut parts = head.split(';');
            let name_part = parts.next().unwrap_or_default();
            let (group, name) = match name_part.split_once('.') {
                Some((group, name)) => (group.to_string(), name.to_string()),
                None => (String::new(), name_part.to_string()),
            };
            let name = name.to_ascii_uppercase();

            if name == "BEGIN" && value.eq_ignore_ascii_case("VCARD") {
                saw_begin = true;
                continue;
            }
            if name == "END" && value.eq_ignore_ascii_case("VCARD") {
                saw_end = true;
                continue;
            }

            let params = parts
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (k.to_ascii_uppercase(), v.to_string()),
                    None => (p.to_ascii_uppercase(), String::new()),
                })
                .collect();

            card.properties.push(Property {
                group,
                name,
                params,
                value,
            });
        }
        card.complete = saw_begin && saw_end;
        card
    }

    pub fn is_incomplete(&self) -> bool {
        !self.complete
    }

    pub fn first_value(&self, name: &str) -> String {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.clone())
            .unwrap_or_default()
    }

    pub fn unique_id(&self) -> String {
        self.first_value("UID")
    }

    pub fn formatted_name(&self) -> String {
        let fn_value = self.first_value("FN");
        if !fn_value.is_empty() {
            return fn_value;
        }
        // N is structured: Family;Given;Middle;Prefix;Suffix
        let n = self.first_value("N");
        let mut parts: Vec<&str> = n.split(';').filter(|s| !s.is_empty()).collect();
        parts.reverse();
        parts.join(" ")
    }

    pub fn emails(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|p| p.name == "EMAIL")
            .map(|p| p.value.clone())
            .collect()
    }

    /// Group carrier-cards: vCard4 `KIND:group` or the iCloud vCard3
    /// extension.
    pub fn is_group(&self) -> bool {
        if self.first_value("KIND").eq_ignore_ascii_case("group") {
            return true;
        }
        self.first_value(X_VCARD3_KIND).eq_ignore_ascii_case("group")
    }

    /// Member references with the `urn:uuid:` prefix stripped.
    pub fn members(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|p| p.name == "MEMBER" || p.name == X_VCARD3_MEMBER)
            .map(|p| {
                p.value
                    .strip_prefix("urn:uuid:")
                    .unwrap_or(&p.value)
                    .to_string()
            })
            .collect()
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from("BEGIN:VCARD\r\n");
        for prop in &self.properties {
            out.push_str(&prop.serialize());
            out.push_str("\r\n");
        }
        out.push_str("END:VCARD\r\n");
        out
    }
}

/// Parameter values may be quoted and contain colons (e.g. a URL in a
/// TYPE param); the property value starts at the first colon outside
/// quotes.
fn find_unquoted_colon(line: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD: &str = "BEGIN:VCARD\r\nVERSION:3.0\r\nUID:b0a-11\r\nFN:Ana Lovelace\r\nN:Lovelace;Ana;;;\r\nEMAIL;TYPE=INTERNET:ana@example.com\r\nEMAIL:ana@backup.example.com\r\nEND:VCARD\r\n";

    #[test]
    fn parses_basic_fields() {
        let card = VCard::parse(CARD);
        assert!(!card.is_incomplete());
        assert_eq!(card.unique_id(), "b0a-11");
        assert_eq!(card.formatted_name(), "Ana Lovelace");
        assert_eq!(
            card.emails(),
            vec!["ana@example.com", "ana@backup.example.com"]
        );
        assert!(!card.is_group());
    }

    #[test]
    fn unfolds_continuation_lines() {
        let folded = "BEGIN:VCARD\r\nFN:A very long na\r\n me that was folded\r\nEND:VCARD\r\n";
        let card = VCard::parse(folded);
        assert_eq!(card.first_value("FN"), "A very long name that was folded");
    }

    #[test]
    fn falls_back_to_structured_name() {
        let text = "BEGIN:VCARD\r\nN:Lovelace;Ana;;;\r\nEND:VCARD\r\n";
        assert_eq!(VCard::parse(text).formatted_name(), "Ana Lovelace");
    }

    #[test]
    fn detects_vcard4_and_icloud_groups() {
        let v4 = "BEGIN:VCARD\r\nKIND:group\r\nFN:Team\r\nMEMBER:urn:uuid:u-1\r\nMEMBER:urn:uuid:u-2\r\nEND:VCARD\r\n";
        let card = VCard::parse(v4);
        assert!(card.is_group());
        assert_eq!(card.members(), vec!["u-1", "u-2"]);

        let v3 = "BEGIN:VCARD\r\nX-ADDRESSBOOKSERVER-KIND:group\r\nFN:Team\r\nX-ADDRESSBOOKSERVER-MEMBER:urn:uuid:u-3\r\nEND:VCARD\r\n";
        let card = VCard::parse(v3);
        assert!(card.is_group());
        assert_eq!(card.members(), vec!["u-3"]);
    }

    #[test]
    fn missing_envelope_is_incomplete() {
        assert!(VCard::parse("FN:Nobody\r\n").is_incomplete());
    }

    #[test]
    fn colon_inside_quoted_param_is_not_a_separator() {
        let text = "BEGIN:VCARD\r\nX-URL;LABEL=\"see: here\":https://example.com\r\nEND:VCARD\r\n";
        let card = VCard::parse(text);
        assert_eq!(card.first_value("X-URL"), "https://example.com");
    }

    #[test]
    fn serialization_folds_long_lines() {
        let mut card = VCard::parse(CARD);
        card.properties.push(Property {
            group: String::new(),
            name: "NOTE".into(),
            params: vec![],
            value: "x".repeat(200),
        });
        let out = card.serialize();
        assert!(out.lines().all(|l| l.len() <= FOLD_WIDTH));
        let reparsed = VCard::parse(&out);
        assert_eq!(reparsed.first_value("NOTE"), "x".repeat(200));
    }
}
