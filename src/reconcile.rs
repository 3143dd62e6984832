use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    jid::{is_placeholder_name, phone_key, Jid, JidKind},
    types::Contact,
};

pub const DEFAULT_DEDUP_WINDOW_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub from_me: bool,
    pub message_type: String,
    pub content: String,
    pub media_url: String,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    fn gateway_id(&self) -> Option<&str> {
        self.external_id.as_deref().filter(|id| !id.trim().is_empty())
    }

    fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    ExternalId,
    NearDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupGroup {
    pub reason: DuplicateReason,
    pub keep: String,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupPlan {
    pub keep: Vec<String>,
    pub remove: Vec<String>,
    pub groups: Vec<DedupGroup>,
}

impl DedupPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
    }

    fn push(&mut self, group: DedupGroup) {
        self.keep.push(group.keep.clone());
        self.remove.extend(group.remove.iter().cloned());
        self.groups.push(group);
    }
}

/// Content identity of a message, insensitive to case and spacing.
pub fn content_fingerprint(message_type: &str, content: &str, media_url: &str) -> String {
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(message_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(media_url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn plan_message_dedup(rows: &[MessageRow], window_secs: i64) -> DedupPlan {
    let mut plan = DedupPlan::default();
    let mut removed = HashSet::new();

    let mut by_external: BTreeMap<&str, Vec<&MessageRow>> = BTreeMap::new();
    for row in rows {
        if let Some(id) = row.gateway_id() {
            by_external.entry(id).or_default().push(row);
        }
    }
    for (_, mut group) in by_external {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        let keep = group[0].id.clone();
        let remove = group[1..].iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        removed.extend(remove.iter().cloned());
        plan.push(DedupGroup {
            reason: DuplicateReason::ExternalId,
            keep,
            remove,
        });
    }

    let mut by_fingerprint: BTreeMap<(&str, bool, String), Vec<&MessageRow>> = BTreeMap::new();
    for row in rows {
        if removed.contains(&row.id) {
            continue;
        }
        if row.content.trim().is_empty() && row.media_url.trim().is_empty() {
            continue;
        }
        let fingerprint = content_fingerprint(&row.message_type, &row.content, &row.media_url);
        by_fingerprint
            .entry((row.conversation_id.as_str(), row.from_me, fingerprint))
            .or_default()
            .push(row);
    }

    let window = chrono::Duration::seconds(window_secs.max(0));
    for (_, mut group) in by_fingerprint {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        let mut clusters: Vec<Vec<&MessageRow>> = Vec::new();
        for row in group {
            let joins = clusters
                .last()
                .and_then(|cluster| cluster.last())
                .is_some_and(|prev| row.created_at - prev.created_at <= window);
            if joins {
                if let Some(cluster) = clusters.last_mut() {
                    cluster.push(row);
                }
            } else {
                clusters.push(vec![row]);
            }
        }
        for cluster in clusters {
            if let Some(group) = near_duplicate_group(&cluster) {
                plan.push(group);
            }
        }
    }

    plan
}

fn near_duplicate_group(cluster: &[&MessageRow]) -> Option<DedupGroup> {
    if cluster.len() < 2 {
        return None;
    }
    let confirmed = cluster.iter().find(|r| r.gateway_id().is_some());
    let (keep, remove) = match confirmed {
        Some(keep) => (
            keep.id.clone(),
            cluster
                .iter()
                .filter(|r| r.gateway_id().is_none())
                .map(|r| r.id.clone())
                .collect::<Vec<_>>(),
        ),
        None => (
            cluster[0].id.clone(),
            cluster[1..].iter().map(|r| r.id.clone()).collect(),
        ),
    };
    if remove.is_empty() {
        return None;
    }
    Some(DedupGroup {
        reason: DuplicateReason::NearDuplicate,
        keep,
        remove,
    })
}

// ── Contacts ────────────────────────────────────────────────────────────

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // smaller root wins so grouping does not depend on input order
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

fn contact_identity_keys(contact: &Contact) -> Vec<String> {
    let mut keys = Vec::new();
    if !contact.phone.trim().is_empty() {
        keys.push(format!("phone:{}", phone_key(contact.phone.trim())));
    }
    if !contact.lid.trim().is_empty() {
        keys.push(format!("lid:{}", contact.lid.trim()));
    }
    if let Some(jid) = Jid::parse(&contact.remote_jid) {
        if matches!(jid.kind, JidKind::Phone | JidKind::Lid) {
            keys.push(jid.identity_key());
        }
    }
    keys
}

fn has_real_name(contact: &Contact) -> bool {
    !is_placeholder_name(&contact.name, &contact.phone, &contact.lid)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFill {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub lid: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMergeGroup {
    pub survivor: String,
    pub merged: Vec<String>,
    pub fill: ContactFill,
}

pub fn plan_contact_merge(contacts: &[Contact]) -> Vec<ContactMergeGroup> {
    let mut sorted = contacts.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let mut set = DisjointSet::new(sorted.len());
    let mut first_owner: HashMap<String, usize> = HashMap::new();
    for (index, contact) in sorted.iter().enumerate() {
        for key in contact_identity_keys(contact) {
            match first_owner.get(&key) {
                Some(&owner) => set.union(owner, index),
                None => {
                    first_owner.insert(key, index);
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<&Contact>> = BTreeMap::new();
    for index in 0..sorted.len() {
        let root = set.find(index);
        groups.entry(root).or_default().push(sorted[index]);
    }

    groups
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|members| {
            // members are already oldest first
            let survivor = members
                .iter()
                .copied()
                .min_by_key(|c| (!has_real_name(c), c.avatar_url.trim().is_empty()))
                .unwrap_or(members[0]);
            let others = members
                .iter()
                .filter(|c| c.id != survivor.id)
                .copied()
                .collect::<Vec<_>>();

            let mut fill = ContactFill::default();
            if !has_real_name(survivor) {
                fill.name = others
                    .iter()
                    .find(|c| has_real_name(c))
                    .map(|c| c.name.trim().to_string());
            }
            if survivor.phone.trim().is_empty() {
                fill.phone = others
                    .iter()
                    .find(|c| !c.phone.trim().is_empty())
                    .map(|c| phone_key(c.phone.trim()));
            }
            if survivor.lid.trim().is_empty() {
                fill.lid = others
                    .iter()
                    .find(|c| !c.lid.trim().is_empty())
                    .map(|c| c.lid.trim().to_string());
            }
            if survivor.avatar_url.trim().is_empty() {
                fill.avatar_url = others
                    .iter()
                    .find(|c| !c.avatar_url.trim().is_empty())
                    .map(|c| c.avatar_url.clone());
            }

            ContactMergeGroup {
                survivor: survivor.id.clone(),
                merged: others.iter().map(|c| c.id.clone()).collect(),
                fill,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ObservedName {
    pub contact_id: String,
    pub push_name: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameFix {
    pub contact_id: String,
    pub from: String,
    pub to: String,
}

pub fn plan_name_enrichment(contacts: &[Contact], observed: &[ObservedName]) -> Vec<NameFix> {
    let mut tallies: HashMap<&str, HashMap<&str, (usize, DateTime<Utc>)>> = HashMap::new();
    for seen in observed {
        let name = seen.push_name.trim();
        if name.is_empty() {
            continue;
        }
        let entry = tallies
            .entry(seen.contact_id.as_str())
            .or_default()
            .entry(name)
            .or_insert((0, seen.seen_at));
        entry.0 += 1;
        entry.1 = entry.1.max(seen.seen_at);
    }

    let mut fixes = contacts
        .iter()
        .filter(|c| !has_real_name(c))
        .filter_map(|contact| {
            let names = tallies.get(contact.id.as_str())?;
            let (best, _) = names
                .iter()
                .filter(|(name, _)| !is_placeholder_name(name, &contact.phone, &contact.lid))
                .max_by(|(an, (ac, at)), (bn, (bc, bt))| {
                    ac.cmp(bc).then(at.cmp(bt)).then(bn.cmp(an))
                })?;
            Some(NameFix {
                contact_id: contact.id.clone(),
                from: contact.name.clone(),
                to: best.to_string(),
            })
        })
        .collect::<Vec<_>>();
    fixes.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
    fixes
}

// ── Conversations ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: String,
    pub remote_jid: String,
    pub contact_id: Option<String>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMergeGroup {
    pub survivor: String,
    pub merged: Vec<String>,
    /// New `remote_jid` for the survivor when it is not already canonical.
    pub remote_jid: Option<String>,
}

/// Canonical chat key for a stored `remote_jid`, resolving lids to phones
/// through `lid_to_phone` (lid user → phone digits).
fn chat_key(remote_jid: &str, lid_to_phone: &HashMap<String, String>) -> Option<(String, String)> {
    let jid = Jid::parse(remote_jid)?;
    let canonical = match jid.kind {
        JidKind::Lid => match lid_to_phone.get(&jid.user) {
            Some(phone) => Jid::phone(&phone_key(phone))?,
            None => jid,
        },
        JidKind::Phone => Jid::phone(&phone_key(&jid.user))?,
        _ => jid,
    };
    Some((canonical.identity_key(), canonical.to_string()))
}

pub fn plan_conversation_merge(
    conversations: &[ConversationRow],
    lid_to_phone: &HashMap<String, String>,
) -> Vec<ConversationMergeGroup> {
    let mut groups: BTreeMap<String, (String, Vec<&ConversationRow>)> = BTreeMap::new();
    for conversation in conversations {
        let Some((key, canonical)) = chat_key(&conversation.remote_jid, lid_to_phone) else {
            continue;
        };
        groups
            .entry(key)
            .or_insert_with(|| (canonical, Vec::new()))
            .1
            .push(conversation);
    }

    groups
        .into_values()
        .filter_map(|(canonical, members)| {
            let survivor = members.iter().copied().min_by(|a, b| {
                b.message_count
                    .cmp(&a.message_count)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })?;
            let mut merged = members
                .iter()
                .filter(|c| c.id != survivor.id)
                .map(|c| c.id.clone())
                .collect::<Vec<_>>();
            merged.sort();
            let remote_jid = (survivor.remote_jid != canonical).then_some(canonical);
            if merged.is_empty() && remote_jid.is_none() {
                return None;
            }
            Some(ConversationMergeGroup {
                survivor: survivor.id.clone(),
                merged,
                remote_jid,
            })
        })
        .collect()
}
