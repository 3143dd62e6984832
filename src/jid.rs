use std::{fmt, sync::OnceLock};

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JidKind {
    Phone,
    Lid,
    Group,
    Broadcast,
    Newsletter,
}

/// A gateway address such as `5511987654321:3@s.whatsapp.net`,
/// `551187654321@c.us` or an anonymous `123456789012345@lid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub kind: JidKind,
}

impl Jid {
    pub fn parse(raw: &str) -> Option<Jid> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (user_part, server) = match raw.split_once('@') {
            Some((user, server)) => (user, server.trim().to_ascii_lowercase()),
            None => (raw, String::new()),
        };
        let user = user_part.split(':').next().unwrap_or("").trim();
        if user.is_empty() {
            return None;
        }

        let kind = match server.as_str() {
            "" | "s.whatsapp.net" | "c.us" => JidKind::Phone,
            "lid" => JidKind::Lid,
            "g.us" => JidKind::Group,
            "broadcast" => JidKind::Broadcast,
            "newsletter" => JidKind::Newsletter,
            _ => return None,
        };

        let user = match kind {
            JidKind::Phone | JidKind::Lid => normalize_phone(user)?,
            _ => user.to_string(),
        };
        Some(Jid { user, kind })
    }

    pub fn phone(user: &str) -> Option<Jid> {
        Some(Jid {
            user: normalize_phone(user)?,
            kind: JidKind::Phone,
        })
    }

    pub fn is_group(&self) -> bool {
        self.kind == JidKind::Group
    }

    pub fn is_lid(&self) -> bool {
        self.kind == JidKind::Lid
    }

    /// Chats the inbox keeps conversations for.
    pub fn is_chat(&self) -> bool {
        matches!(self.kind, JidKind::Phone | JidKind::Lid | JidKind::Group)
    }

    pub fn phone_digits(&self) -> Option<&str> {
        (self.kind == JidKind::Phone).then_some(self.user.as_str())
    }

    /// Identity used to decide whether two JIDs denote the same chat.
    pub fn identity_key(&self) -> String {
        match self.kind {
            JidKind::Phone => format!("phone:{}", phone_key(&self.user)),
            JidKind::Lid => format!("lid:{}", self.user),
            JidKind::Group => format!("group:{}", self.user),
            JidKind::Broadcast => format!("broadcast:{}", self.user),
            JidKind::Newsletter => format!("newsletter:{}", self.user),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let server = match self.kind {
            JidKind::Phone => "s.whatsapp.net",
            JidKind::Lid => "lid",
            JidKind::Group => "g.us",
            JidKind::Broadcast => "broadcast",
            JidKind::Newsletter => "newsletter",
        };
        write!(f, "{}@{}", self.user, server)
    }
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn is_br_mobile_without_ninth(digits: &str) -> bool {
    digits.len() == 12
        && digits.starts_with("55")
        && matches!(digits.as_bytes()[4], b'6'..=b'9')
}

fn is_br_mobile_with_ninth(digits: &str) -> bool {
    let bytes = digits.as_bytes();
    digits.len() == 13
        && digits.starts_with("55")
        && bytes[4] == b'9'
        && matches!(bytes[5], b'6'..=b'9')
}

/// Canonical digits for identity comparison. Brazilian mobiles are stored
/// both with and without the ninth digit; the key always carries it.
pub fn phone_key(digits: &str) -> String {
    if is_br_mobile_without_ninth(digits) {
        format!("{}9{}", &digits[..4], &digits[4..])
    } else {
        digits.to_string()
    }
}

/// Every stored form that may denote the same number as `digits`.
pub fn phone_variants(digits: &str) -> Vec<String> {
    let key = phone_key(digits);
    let mut variants = vec![key.clone()];
    if is_br_mobile_with_ninth(&key) {
        variants.push(format!("{}{}", &key[..4], &key[5..]));
    }
    if !variants.iter().any(|v| v == digits) {
        variants.push(digits.to_string());
    }
    variants
}

/// Value for the gateway's `number` field. Groups and lids must be sent with
/// their full JID; the digits alone resolve to the wrong chat.
pub fn send_target(jid: &Jid) -> String {
    match jid.kind {
        JidKind::Phone => jid.user.clone(),
        _ => jid.to_string(),
    }
}

fn is_numeric_name(name: &str) -> bool {
    static NUMERIC_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    NUMERIC_NAME
        .get_or_init(|| Regex::new(r"^[\d\s+().\-]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

const PLACEHOLDER_NAMES: [&str; 7] = [
    "unknown",
    "desconhecido",
    "sem nome",
    "contato",
    "contact",
    "~",
    ".",
];

/// True when `name` carries no information beyond the identifiers we already
/// have, so a pushName or address-book name should replace it.
pub fn is_placeholder_name(name: &str, phone: &str, lid: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return true;
    }
    let lowered = name.to_lowercase();
    if PLACEHOLDER_NAMES.contains(&lowered.as_str()) {
        return true;
    }
    if is_numeric_name(name) {
        return true;
    }
    if lowered.contains("@s.whatsapp.net") || lowered.contains("@lid") || lowered.contains("@c.us") {
        return true;
    }
    (!phone.is_empty() && name == phone) || (!lid.is_empty() && name == lid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phone_forms_to_the_same_jid() {
        let a = Jid::parse("5511987654321@s.whatsapp.net").expect("jid");
        let b = Jid::parse("5511987654321:12@s.whatsapp.net").expect("jid");
        let c = Jid::parse("5511987654321@c.us").expect("jid");
        let d = Jid::parse("+55 (11) 98765-4321").expect("jid");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(a.to_string(), "5511987654321@s.whatsapp.net");
        assert_eq!(a.phone_digits(), Some("5511987654321"));
    }

    #[test]
    fn parses_lid_group_and_broadcast() {
        let lid = Jid::parse("123456789012345@lid").expect("lid");
        assert!(lid.is_lid());
        assert_eq!(lid.phone_digits(), None);

        let group = Jid::parse("120363025246125486@g.us").expect("group");
        assert!(group.is_group());
        assert!(group.is_chat());

        let status = Jid::parse("status@broadcast").expect("broadcast");
        assert_eq!(status.kind, JidKind::Broadcast);
        assert!(!status.is_chat());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Jid::parse(""), None);
        assert_eq!(Jid::parse("   "), None);
        assert_eq!(Jid::parse("@s.whatsapp.net"), None);
        assert_eq!(Jid::parse("abc"), None);
        assert_eq!(Jid::parse("5511@example.org"), None);
    }

    #[test]
    fn brazilian_ninth_digit_forms_share_a_key() {
        assert_eq!(phone_key("551187654321"), "5511987654321");
        assert_eq!(phone_key("5511987654321"), "5511987654321");
        // landlines start with 2-5 and never gain the ninth digit
        assert_eq!(phone_key("551133334444"), "551133334444");
        assert_eq!(phone_key("14155550100"), "14155550100");

        let short = Jid::parse("551187654321@s.whatsapp.net").expect("jid");
        let long = Jid::parse("5511987654321@s.whatsapp.net").expect("jid");
        assert_eq!(short.identity_key(), long.identity_key());
    }

    #[test]
    fn variants_cover_both_brazilian_forms() {
        assert_eq!(
            phone_variants("551187654321"),
            vec!["5511987654321".to_string(), "551187654321".to_string()]
        );
        assert_eq!(
            phone_variants("5511987654321"),
            vec!["5511987654321".to_string(), "551187654321".to_string()]
        );
        assert_eq!(phone_variants("14155550100"), vec!["14155550100".to_string()]);
    }

    #[test]
    fn groups_are_sent_with_full_jid() {
        let group = Jid::parse("120363025246125486@g.us").expect("group");
        assert_eq!(send_target(&group), "120363025246125486@g.us");
        let phone = Jid::parse("5511987654321@s.whatsapp.net").expect("phone");
        assert_eq!(send_target(&phone), "5511987654321");
    }

    #[test]
    fn detects_placeholder_names() {
        assert!(is_placeholder_name("", "", ""));
        assert!(is_placeholder_name("5511987654321", "5511987654321", ""));
        assert!(is_placeholder_name("+55 11 98765-4321", "", ""));
        assert!(is_placeholder_name("Desconhecido", "", ""));
        assert!(is_placeholder_name("123456789@lid", "", "123456789"));
        assert!(!is_placeholder_name("Maria Souza", "5511987654321", ""));
        assert!(!is_placeholder_name("Loja 24h", "", ""));
    }
}
