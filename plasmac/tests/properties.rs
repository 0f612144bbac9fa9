//! Property-based tests for domain unification.
//!
//! Uses proptest to generate random domains and verify the algebraic
//! laws the solver depends on.

use std::collections::BTreeSet;

use proptest::prelude::*;

use plasmac::typeck::solver::{unify_domains, unify_resources, Domain, Resources};
use plasmac::types::{BuiltinType, ResourceId, TypeId};

fn builtin() -> impl Strategy<Value = BuiltinType> {
    prop_oneof![
        Just(BuiltinType::Int),
        Just(BuiltinType::String),
        Just(BuiltinType::Codepoint),
        Just(BuiltinType::StringPos),
    ]
}

fn resource_set() -> impl Strategy<Value = BTreeSet<ResourceId>> {
    prop::collection::btree_set((0u32..4).prop_map(ResourceId), 0..3)
}

fn resources() -> impl Strategy<Value = Resources> {
    prop_oneof![
        Just(Resources::Unknown),
        (resource_set(), resource_set())
            .prop_map(|(used, observed)| Resources::Known { used, observed }),
    ]
}

/// Random domains of bounded depth.
fn domain() -> impl Strategy<Value = Domain> {
    let leaf = prop_oneof![
        Just(Domain::Free),
        builtin().prop_map(Domain::Builtin),
        "[TU]".prop_map(Domain::UnivVar),
    ];
    leaf.prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            ((0u32..3).prop_map(TypeId), prop::collection::vec(inner.clone(), 0..3))
                .prop_map(|(id, args)| Domain::Type { id, args }),
            (
                prop::collection::vec(inner.clone(), 0..2),
                prop::collection::vec(inner, 0..2),
                resources()
            )
                .prop_map(|(inputs, outputs, resources)| Domain::Func {
                    inputs,
                    outputs,
                    resources
                }),
        ]
    })
}

proptest! {
    /// unify(a, b) and unify(b, a) agree on success and on the result.
    #[test]
    fn unification_is_symmetric(a in domain(), b in domain()) {
        match (unify_domains(&a, &b), unify_domains(&b, &a)) {
            (Ok(left), Ok(right)) => {
                prop_assert_eq!(left.domain, right.domain);
                prop_assert_eq!(left.status, right.status);
            }
            (Err(_), Err(_)) => {}
            (left, right) => {
                prop_assert!(false, "asymmetric: {:?} vs {:?}", left, right);
            }
        }
    }

    /// Every domain unifies with itself, producing itself.
    #[test]
    fn unification_is_reflexive(a in domain()) {
        let unified = unify_domains(&a, &a);
        prop_assert!(unified.is_ok(), "self-unification failed: {:?}", unified);
        prop_assert_eq!(unified.unwrap().domain, a);
    }

    /// Free is the identity of unification.
    #[test]
    fn free_is_identity(a in domain()) {
        let unified = unify_domains(&Domain::Free, &a).unwrap();
        prop_assert_eq!(unified.domain, a);
    }

    /// unknown is the identity of resource unification.
    #[test]
    fn unknown_is_resource_identity(r in resources()) {
        prop_assert_eq!(unify_resources(&Resources::Unknown, &r), r.clone());
        prop_assert_eq!(unify_resources(&r, &Resources::Unknown), r);
    }

    /// Resource unification is a union in both positions.
    #[test]
    fn resource_union(u1 in resource_set(), o1 in resource_set(),
                      u2 in resource_set(), o2 in resource_set()) {
        let a = Resources::Known { used: u1.clone(), observed: o1.clone() };
        let b = Resources::Known { used: u2.clone(), observed: o2.clone() };
        let expected = Resources::Known {
            used: u1.union(&u2).cloned().collect(),
            observed: o1.union(&o2).cloned().collect(),
        };
        prop_assert_eq!(unify_resources(&a, &b), expected);
    }

    /// Resource unification is idempotent and commutative.
    #[test]
    fn resource_unification_laws(a in resources(), b in resources()) {
        prop_assert_eq!(unify_resources(&a, &a), a.clone());
        prop_assert_eq!(unify_resources(&a, &b), unify_resources(&b, &a));
    }

    /// Unifying with a ground domain yields a ground domain.
    #[test]
    fn ground_absorbs(a in domain(), b in domain()) {
        if let Ok(unified) = unify_domains(&a, &b) {
            if a.is_ground() || b.is_ground() {
                prop_assert!(unified.domain.is_ground());
            }
        }
    }
}
