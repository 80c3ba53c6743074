//! Family-membership permission helpers.
//!
//! Vocabulary:
//! - *viewable*: the user holds any membership (parent, teacher or admin) in the family.
//! - *editable*: the user holds a parent or admin membership in the family.
//!
//! Records without a family are legacy rows. Only the user named in their
//! `owner_id` can see or change them.

use std::collections::BTreeSet;

use crate::store::{Store, StoreResult};
use crate::types::{
    Assignment, Curriculum, Family, FamilyId, FamilyMembership, ResourceRow, Role, Student,
};

/// A record that is owned either by a family or, for legacy rows, by one user.
pub trait Owned {
    fn owner_id(&self) -> &str;
    fn family_id(&self) -> Option<FamilyId>;
}

impl Owned for ResourceRow {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn family_id(&self) -> Option<FamilyId> {
        self.family_id
    }
}

macro_rules! impl_owned {
    ($($ty:ty),*) => {
        $(impl Owned for $ty {
            fn owner_id(&self) -> &str {
                &self.owner_id
            }

            fn family_id(&self) -> Option<FamilyId> {
                self.family_id
            }
        })*
    };
}

impl_owned!(Student, Curriculum, Assignment);

impl<T: Owned> Owned for &T {
    fn owner_id(&self) -> &str {
        (*self).owner_id()
    }

    fn family_id(&self) -> Option<FamilyId> {
        (*self).family_id()
    }
}

/// Snapshot of one user's memberships, loaded once per request.
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    user_id: String,
    memberships: Vec<FamilyMembership>,
}

impl Access {
    pub async fn load<S: Store + ?Sized>(store: &S, user_id: &str) -> StoreResult<Self> {
        let memberships = store.memberships_for_user(user_id).await?;
        Ok(Self::from_memberships(user_id, memberships))
    }

    /// Memberships belonging to other users are ignored.
    pub fn from_memberships(user_id: impl Into<String>, memberships: Vec<FamilyMembership>) -> Self {
        let user_id = user_id.into();
        let mut memberships: Vec<_> = memberships
            .into_iter()
            .filter(|m| m.user_id == user_id)
            .collect();
        memberships.sort_by_key(|m| m.id);
        Self {
            user_id,
            memberships,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Memberships ordered by ascending membership id.
    pub fn memberships(&self) -> &[FamilyMembership] {
        &self.memberships
    }

    pub fn role_in(&self, family_id: FamilyId) -> Option<Role> {
        self.memberships
            .iter()
            .find(|m| m.family_id == family_id)
            .map(|m| m.role)
    }

    pub fn viewable_family_ids(&self) -> BTreeSet<FamilyId> {
        self.memberships.iter().map(|m| m.family_id).collect()
    }

    pub fn editable_family_ids(&self) -> BTreeSet<FamilyId> {
        self.memberships
            .iter()
            .filter(|m| m.role.can_edit())
            .map(|m| m.family_id)
            .collect()
    }

    /// First family in which the user holds `role`, by ascending membership id.
    pub fn first_family_with_role(&self, role: Role) -> Option<FamilyId> {
        self.memberships
            .iter()
            .find(|m| m.role == role)
            .map(|m| m.family_id)
    }
}

/// "family in set OR (family is null AND owner matches)".
///
/// Store backends translate the same value into their own query form, so the
/// in-memory predicate and the DynamoDB filter expression cannot drift apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    families: BTreeSet<FamilyId>,
    legacy_owner: Option<String>,
}

impl RecordFilter {
    pub fn new(families: BTreeSet<FamilyId>, legacy_owner: Option<String>) -> Self {
        Self {
            families,
            legacy_owner,
        }
    }

    pub fn viewable(access: &Access) -> Self {
        Self::new(access.viewable_family_ids(), Some(access.user_id.clone()))
    }

    pub fn editable(access: &Access) -> Self {
        Self::new(access.editable_family_ids(), Some(access.user_id.clone()))
    }

    /// Records of one selected family.
    ///
    /// Without a family only the user's legacy rows match. Parents and admins
    /// keep their legacy rows next to the family's; teachers never see legacy
    /// rows. A family the user does not belong to contributes nothing.
    pub fn scoped(access: &Access, family_id: Option<FamilyId>) -> Self {
        let Some(family_id) = family_id else {
            return Self::legacy(access);
        };

        let mut families = BTreeSet::new();
        if access.role_in(family_id).is_some() {
            families.insert(family_id);
        }
        let legacy_owner = user_can_edit(access).then(|| access.user_id.clone());
        Self::new(families, legacy_owner)
    }

    /// Only the user's own null-family rows.
    pub fn legacy(access: &Access) -> Self {
        Self::new(BTreeSet::new(), Some(access.user_id.clone()))
    }

    pub fn families(&self) -> &BTreeSet<FamilyId> {
        &self.families
    }

    pub fn legacy_owner(&self) -> Option<&str> {
        self.legacy_owner.as_deref()
    }

    /// True when no record can possibly match.
    pub fn is_empty(&self) -> bool {
        self.families.is_empty() && self.legacy_owner.is_none()
    }

    pub fn matches<R: Owned + ?Sized>(&self, record: &R) -> bool {
        match record.family_id() {
            Some(family_id) => self.families.contains(&family_id),
            None => self.legacy_owner.as_deref() == Some(record.owner_id()),
        }
    }

    pub fn apply<R: Owned>(&self, records: impl IntoIterator<Item = R>) -> Vec<R> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

/// True if the user may edit anything at all.
///
/// A user without any membership predates families and owns their own data,
/// so they keep full rights over it. Teacher-only users get no edit rights.
pub fn user_can_edit(access: &Access) -> bool {
    access.memberships.is_empty() || access.memberships.iter().any(|m| m.role.can_edit())
}

pub fn can_view_family(access: &Access, family: Option<&Family>) -> bool {
    family.is_some_and(|f| access.role_in(f.id).is_some())
}

pub fn can_edit_family(access: &Access, family: Option<&Family>) -> bool {
    family.is_some_and(|f| access.role_in(f.id).is_some_and(Role::can_edit))
}

pub fn viewable_record_set<R: Owned>(records: impl IntoIterator<Item = R>, access: &Access) -> Vec<R> {
    RecordFilter::viewable(access).apply(records)
}

pub fn editable_record_set<R: Owned>(records: impl IntoIterator<Item = R>, access: &Access) -> Vec<R> {
    RecordFilter::editable(access).apply(records)
}

pub fn scoped_record_set<R: Owned>(
    records: impl IntoIterator<Item = R>,
    access: &Access,
    family: Option<&Family>,
) -> Vec<R> {
    RecordFilter::scoped(access, family.map(|f| f.id)).apply(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;
    use chrono::Utc;

    fn membership(id: i64, user: &str, family_id: FamilyId, role: Role) -> FamilyMembership {
        FamilyMembership {
            id,
            user_id: user.to_string(),
            family_id,
            role,
            created_at: Utc::now(),
        }
    }

    fn row(id: i64, owner: &str, family_id: Option<FamilyId>) -> ResourceRow {
        ResourceRow {
            kind: ResourceKind::Student,
            id,
            owner_id: owner.to_string(),
            family_id,
            data: serde_json::json!({ "owner_id": owner, "family_id": family_id }),
        }
    }

    fn family(id: FamilyId) -> Family {
        Family {
            id,
            name: format!("Family {id}"),
            organization_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn user_without_memberships_can_edit() {
        let access = Access::from_memberships("legacy", vec![]);
        assert!(user_can_edit(&access));
    }

    #[test]
    fn teacher_only_user_cannot_edit() {
        let access = Access::from_memberships(
            "t",
            vec![
                membership(1, "t", 1, Role::Teacher),
                membership(2, "t", 2, Role::Teacher),
            ],
        );
        assert!(!user_can_edit(&access));
    }

    #[test]
    fn admin_in_any_family_can_edit() {
        let access = Access::from_memberships(
            "a",
            vec![
                membership(1, "a", 1, Role::Teacher),
                membership(2, "a", 2, Role::Admin),
            ],
        );
        assert!(user_can_edit(&access));
    }

    #[test]
    fn foreign_memberships_are_ignored() {
        let access = Access::from_memberships("u", vec![membership(1, "other", 1, Role::Teacher)]);
        assert!(access.memberships().is_empty());
        assert!(user_can_edit(&access));
    }

    #[test]
    fn viewable_is_union_of_family_and_legacy_rows() {
        let access = Access::from_memberships("t", vec![membership(1, "t", 10, Role::Teacher)]);
        let rows = vec![
            row(1, "parent", Some(10)),
            row(2, "parent", Some(11)),
            row(3, "t", None),
            row(4, "parent", None),
        ];

        let ids: Vec<_> = viewable_record_set(rows.iter(), &access)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn editable_needs_parent_or_admin_role() {
        let access = Access::from_memberships(
            "u",
            vec![
                membership(1, "u", 10, Role::Teacher),
                membership(2, "u", 11, Role::Parent),
                membership(3, "u", 12, Role::Admin),
            ],
        );
        let rows = vec![
            row(1, "x", Some(10)),
            row(2, "x", Some(11)),
            row(3, "x", Some(12)),
        ];
        let ids: Vec<_> = editable_record_set(rows, &access).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn legacy_rows_belong_to_their_owner_only() {
        let owner = Access::from_memberships("owner", vec![]);
        let other = Access::from_memberships("other", vec![membership(1, "other", 1, Role::Parent)]);
        let rows = vec![row(1, "owner", None)];

        assert_eq!(viewable_record_set(rows.iter(), &owner).len(), 1);
        assert_eq!(editable_record_set(rows.iter(), &owner).len(), 1);
        assert!(viewable_record_set(rows.iter(), &other).is_empty());
        assert!(editable_record_set(rows.iter(), &other).is_empty());
    }

    #[test]
    fn scoped_without_family_returns_only_legacy_rows() {
        let access = Access::from_memberships("u", vec![membership(1, "u", 10, Role::Parent)]);
        let rows = vec![row(1, "u", Some(10)), row(2, "u", None)];
        let ids: Vec<_> = scoped_record_set(rows, &access, None)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn scoped_parent_keeps_legacy_rows() {
        let access = Access::from_memberships("p", vec![membership(1, "p", 10, Role::Parent)]);
        let rows = vec![
            row(1, "p", Some(10)),
            row(2, "p", None),
            row(3, "q", None),
            row(4, "p", Some(11)),
        ];
        let ids: Vec<_> = scoped_record_set(rows, &access, Some(&family(10)))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn scoped_teacher_sees_family_rows_only() {
        let access = Access::from_memberships("t", vec![membership(1, "t", 10, Role::Teacher)]);
        let mut rows = vec![row(1, "p", Some(10)), row(2, "p", Some(10))];
        rows.extend((0..5).map(|i| row(100 + i, &format!("legacy-{i}"), None)));

        let ids: Vec<_> = scoped_record_set(rows, &access, Some(&family(10)))
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn scoped_to_foreign_family_fails_closed() {
        let access = Access::from_memberships("t", vec![membership(1, "t", 10, Role::Teacher)]);
        let rows = vec![row(1, "p", Some(99))];
        assert!(scoped_record_set(rows, &access, Some(&family(99))).is_empty());
    }

    #[test]
    fn family_checks_are_role_filtered() {
        let access = Access::from_memberships(
            "u",
            vec![
                membership(1, "u", 1, Role::Teacher),
                membership(2, "u", 2, Role::Parent),
            ],
        );
        assert!(can_view_family(&access, Some(&family(1))));
        assert!(!can_edit_family(&access, Some(&family(1))));
        assert!(can_edit_family(&access, Some(&family(2))));
        assert!(!can_view_family(&access, Some(&family(3))));
        assert!(!can_view_family(&access, None));
        assert!(!can_edit_family(&access, None));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = RecordFilter::default();
        assert!(filter.is_empty());
        assert!(!filter.matches(&row(1, "u", None)));
        assert!(!filter.matches(&row(2, "u", Some(1))));
    }
}
