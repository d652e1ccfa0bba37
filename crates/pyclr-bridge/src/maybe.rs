//! Reload-tolerant reflection references.
//!
//! A reference to a type or member that may not survive a managed reload. It
//! keeps the name it was created from and re-resolves against the current
//! domain, reporting a tombstone error when that fails.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};
use crate::managed::{Domain, ManagedType, Member, TypeName};
use crate::projection::BindingFilter;

#[derive(Clone)]
pub enum MaybeType {
    Resolved(Arc<ManagedType>),
    Missing(TypeName),
}

impl MaybeType {
    pub fn resolve(domain: &dyn Domain, name: &TypeName) -> Self {
        match domain.resolve(name) {
            Some(ty) => MaybeType::Resolved(ty),
            None => MaybeType::Missing(name.clone()),
        }
    }

    pub fn name(&self) -> &TypeName {
        match self {
            MaybeType::Resolved(ty) => ty.name(),
            MaybeType::Missing(name) => name,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, MaybeType::Resolved(_))
    }

    pub fn value(&self) -> BridgeResult<&Arc<ManagedType>> {
        match self {
            MaybeType::Resolved(ty) => Ok(ty),
            MaybeType::Missing(name) => Err(BridgeError::type_tombstoned(name)),
        }
    }
}

impl fmt::Debug for MaybeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeType::Resolved(ty) => write!(f, "MaybeType({})", ty.name()),
            MaybeType::Missing(name) => write!(f, "MaybeType({name}, missing)"),
        }
    }
}

/// Name of a member as stashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub declaring: TypeName,
    pub member: SmolStr,
}

/// A member reference that may have been lost in a reload.
#[derive(Clone)]
pub struct MaybeMember {
    reference: MemberRef,
    /// Declaring type, present only while it has a bound member of this name
    resolved: Option<Arc<ManagedType>>,
}

impl MaybeMember {
    /// Reference a member of a type known to declare it.
    pub fn new(ty: &Arc<ManagedType>, member: &str) -> Self {
        Self {
            reference: MemberRef {
                declaring: ty.name().clone(),
                member: SmolStr::new(member),
            },
            resolved: Some(Arc::clone(ty)),
        }
    }

    pub fn resolve(domain: &dyn Domain, reference: MemberRef, filter: &BindingFilter) -> Self {
        let resolved = domain.resolve(&reference.declaring).filter(|ty| {
            ty.members_named(&reference.member)
                .any(|member| filter.admits(member))
        });
        Self { reference, resolved }
    }

    pub fn declaring_type(&self) -> &TypeName {
        &self.reference.declaring
    }

    pub fn member_name(&self) -> &str {
        &self.reference.member
    }

    pub fn reference(&self) -> &MemberRef {
        &self.reference
    }

    pub fn is_valid(&self) -> bool {
        self.resolved.is_some()
    }

    /// The declaring type, or the tombstone error naming the member.
    pub fn value(&self) -> BridgeResult<&Arc<ManagedType>> {
        self.resolved.as_ref().ok_or_else(|| {
            BridgeError::member_tombstoned(&self.reference.declaring, self.reference.member.as_str())
        })
    }

    /// Bound overloads of the member.
    pub fn candidates(&self, filter: &BindingFilter) -> BridgeResult<Vec<&Member>> {
        let ty = self.value()?;
        Ok(ty
            .members_named(&self.reference.member)
            .filter(|member| member.is_callable() && filter.admits(member))
            .collect())
    }
}

impl fmt::Debug for MaybeMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MaybeMember({}.{}{})",
            self.reference.declaring,
            self.reference.member,
            if self.is_valid() { "" } else { ", missing" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::{StaticDomain, Value, Visibility};
    use pretty_assertions::assert_eq;

    fn domain(method: &str) -> StaticDomain {
        StaticDomain::new("test").with_type(
            ManagedType::builder(TypeName::parse("Demo.Counter"))
                .method(method, 0, |_, _| Ok(Value::Int(5)))
                .method_with("Secret", Visibility::Private, false, Some(0), |_, _| Ok(Value::None))
                .build(),
        )
    }

    #[test]
    fn test_missing_type_reports_tombstone() {
        let maybe = MaybeType::resolve(&domain("M"), &TypeName::parse("Demo.Gone"));
        assert!(!maybe.is_valid());
        assert_eq!(
            maybe.value().unwrap_err().to_string(),
            "The managed type Demo.Gone no longer exists"
        );
    }

    #[test]
    fn test_member_resolves_against_new_domain() {
        let reference = MemberRef {
            declaring: TypeName::parse("Demo.Counter"),
            member: SmolStr::new("M"),
        };
        let filter = BindingFilter::default();
        let kept = MaybeMember::resolve(&domain("M"), reference.clone(), &filter);
        assert_eq!(kept.candidates(&filter).unwrap().len(), 1);

        let renamed = MaybeMember::resolve(&domain("M2"), reference, &filter);
        assert!(!renamed.is_valid());
        assert_eq!(
            renamed.value().unwrap_err().to_string(),
            "The managed member Demo.Counter.M no longer exists"
        );
    }

    #[test]
    fn test_unbindable_member_does_not_resolve() {
        let reference = MemberRef {
            declaring: TypeName::parse("Demo.Counter"),
            member: SmolStr::new("Secret"),
        };
        assert!(!MaybeMember::resolve(&domain("M"), reference.clone(), &BindingFilter::default()).is_valid());
        assert!(MaybeMember::resolve(&domain("M"), reference, &BindingFilter::new(true)).is_valid());
    }
}
