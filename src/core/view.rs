//! Read operations shared by committed snapshots and open transactions.

use crate::{
    model::{Container, Member, MembershipRef, OrderedEntry},
    types::{ContainerId, ContainerKey, MemberId, MemberKey, Position},
};

use super::error::{StoreError, StoreResult};

/// One-shot ordered listing of a container, ascending by position.
///
/// Produced from a single consistent view; call `list_ordered` again for a fresh one.
#[derive(Debug)]
pub struct OrderedIter {
    inner: std::vec::IntoIter<OrderedEntry>,
}

impl Iterator for OrderedIter {
    type Item = OrderedEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for OrderedIter {}

/// Primitive lookups over some visible state; the provided methods build the
/// name-resolving reads on top of them.
pub(crate) trait StateView {
    fn member_by_id(&self, id: MemberId) -> Option<&Member>;
    fn member_id_by_name(&self, name: &str) -> Option<MemberId>;
    fn container_by_id(&self, id: ContainerId) -> Option<&Container>;
    fn container_id_by_name(&self, name: &str) -> Option<ContainerId>;
    fn position_of(&self, container: ContainerId, member: MemberId) -> Option<Position>;
    fn container_entries(&self, container: ContainerId) -> Vec<(MemberId, Position)>;
    fn container_ids(&self) -> Vec<ContainerId>;

    fn resolve_container(&self, key: ContainerKey<'_>) -> StoreResult<ContainerId> {
        let found = match key {
            ContainerKey::Id(id) => self.container_by_id(id).map(|c| c.id),
            ContainerKey::Name(name) => self.container_id_by_name(name),
        };
        found.ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn resolve_member(&self, key: MemberKey<'_>) -> StoreResult<MemberId> {
        let found = match key {
            MemberKey::Id(id) => self.member_by_id(id).map(|m| m.id),
            MemberKey::Name(name) => self.member_id_by_name(name),
        };
        found.ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn read_member(&self, key: MemberKey<'_>) -> StoreResult<Member> {
        let id = self.resolve_member(key)?;
        self.member_by_id(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn read_container(&self, key: ContainerKey<'_>) -> StoreResult<Container> {
        let id = self.resolve_container(key)?;
        self.container_by_id(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn ordered(&self, key: ContainerKey<'_>) -> StoreResult<OrderedIter> {
        let container = self.resolve_container(key)?;
        let mut entries = self.container_entries(container);
        entries.sort_unstable_by_key(|(member, position)| (*position, *member));
        let rows: Vec<OrderedEntry> = entries
            .into_iter()
            .filter_map(|(member, position)| {
                self.member_by_id(member).map(|m| OrderedEntry {
                    member: m.clone(),
                    position,
                })
            })
            .collect();
        Ok(OrderedIter {
            inner: rows.into_iter(),
        })
    }

    fn membership(
        &self,
        container: ContainerKey<'_>,
        member: MemberKey<'_>,
    ) -> StoreResult<MembershipRef> {
        let c = self.resolve_container(container)?;
        let m = self.resolve_member(member)?;
        let position = self
            .position_of(c, m)
            .ok_or_else(|| StoreError::NotFound(format!("{member} in {container}")))?;
        Ok(MembershipRef {
            container: c,
            member: m,
            position,
        })
    }

    fn all_containers(&self) -> Vec<Container> {
        let mut out: Vec<Container> = self
            .container_ids()
            .into_iter()
            .filter_map(|id| self.container_by_id(id).cloned())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
