use allot_core::constraints::{QuotaConstraint, QuotaConstraintSet};

fn constraint(minimum: Option<u64>, maximum: Option<u64>, expected: Option<u64>) -> QuotaConstraint {
    QuotaConstraint {
        minimum,
        maximum,
        expected,
    }
}

#[test]
fn minimum_clamps_upward() {
    let c = constraint(Some(10), None, None);
    assert!(!c.allows(5));
    assert!(c.allows(10));
    assert!(c.allows(50));
    assert_eq!(c.apply_to(5), 10);
    assert_eq!(c.apply_to(50), 50);
    assert_eq!(c.initial_quota(), 10);
}

#[test]
fn maximum_clamps_downward() {
    let c = constraint(None, Some(20), None);
    assert!(c.allows(0));
    assert!(!c.allows(21));
    assert_eq!(c.apply_to(21), 20);
    assert_eq!(c.initial_quota(), 0);
}

#[test]
fn expected_pins_exactly() {
    let c = constraint(Some(1), Some(100), Some(42));
    assert!(c.allows(42));
    assert!(!c.allows(41));
    assert_eq!(c.apply_to(7), 42);
    assert_eq!(c.initial_quota(), 42);
}

#[test]
fn lookup_by_domain_and_project() {
    let yaml = r#"
domains:
  germany:
    shared:
      capacity: { minimum: 10 }
projects:
  germany/dresden:
    shared:
      capacity: { minimum: 10 }
"#;
    let set: QuotaConstraintSet = serde_yaml::from_str(yaml).unwrap();
    set.validate().unwrap();

    assert_eq!(
        set.for_domain("germany", "shared", "capacity"),
        Some(constraint(Some(10), None, None))
    );
    assert_eq!(set.for_domain("france", "shared", "capacity"), None);
    assert_eq!(
        set.for_project("germany", "dresden", "shared", "capacity"),
        Some(constraint(Some(10), None, None))
    );
    assert_eq!(set.for_project("germany", "berlin", "shared", "capacity"), None);
}

#[test]
fn validate_rejects_inverted_bounds() {
    let set = QuotaConstraintSet {
        domains: [(
            "germany".to_string(),
            [(
                "shared".to_string(),
                [("capacity".to_string(), constraint(Some(10), Some(5), None))]
                    .into_iter()
                    .collect(),
            )]
            .into_iter()
            .collect(),
        )]
        .into_iter()
        .collect(),
        projects: Default::default(),
    };
    assert!(set.validate().is_err());
}

#[test]
fn validate_rejects_malformed_project_key() {
    let yaml = r#"
projects:
  dresden:
    shared:
      capacity: { minimum: 10 }
"#;
    let set: QuotaConstraintSet = serde_yaml::from_str(yaml).unwrap();
    assert!(set.validate().is_err());
}
