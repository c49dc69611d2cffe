//! Member, container, and membership records plus list rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, MemberId, Position};

/// Named item that may belong to any number of containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable member identifier.
    pub id: MemberId,
    /// Unique member name.
    pub name: String,
    /// Free-form payload shown when the member is listed.
    pub text: String,
}

/// Named owner of an ordered set of memberships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Stable container identifier.
    pub id: ContainerId,
    /// Unique container name.
    pub name: String,
}

/// Join record placing one member in one container at one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    /// Owning container.
    pub container: ContainerId,
    /// Referenced member.
    pub member: MemberId,
    /// Ordering key, unique within `container` once committed.
    pub position: Position,
}

/// Membership resolved from a `(container, member)` name pair.
pub type MembershipRef = Membership;

/// One row of an ordered container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedEntry {
    /// Member at this position.
    pub member: Member,
    /// Position of the member in the listed container.
    pub position: Position,
}

impl OrderedEntry {
    /// Formats the entry as `"{position + start}. {text}"`.
    pub fn render(&self, start: Position) -> String {
        format!("{}. {}", self.position.saturating_add(start), self.member.text)
    }
}

impl fmt::Display for OrderedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(1))
    }
}

/// Renders a container header followed by its entries, numbering from `start`.
pub fn render_list<'a>(
    container: &Container,
    entries: impl IntoIterator<Item = &'a OrderedEntry>,
    start: Position,
) -> Vec<String> {
    std::iter::once(format!("List: {}", container.name))
        .chain(entries.into_iter().map(|e| e.render(start)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, text: &str, position: Position) -> OrderedEntry {
        OrderedEntry {
            member: Member {
                id: MemberId(1),
                name: name.to_string(),
                text: text.to_string(),
            },
            position,
        }
    }

    #[test]
    fn entries_render_one_based_by_default() {
        assert_eq!(entry("mow", "Mow lawn", 3).to_string(), "4. Mow lawn");
        assert_eq!(entry("mow", "Mow lawn", 3).render(0), "3. Mow lawn");
    }

    #[test]
    fn list_rendering_keeps_entry_order() {
        let container = Container {
            id: ContainerId(1),
            name: "outdoor".to_string(),
        };
        let entries = [entry("glass", "Clean glass", 0), entry("roof", "Fix roof", 1)];
        assert_eq!(
            render_list(&container, &entries, 1),
            vec!["List: outdoor", "1. Clean glass", "2. Fix roof"]
        );
    }
}
