//! Property tests for pool validation and building

#[cfg(test)]
mod tests {
    use crate::config::builder::build_dispatcher;
    use crate::config::schema::*;
    use crate::config::validate::{validate_config, ValidationError};
    use crate::policy::PolicyRegistry;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashMap};

    // ============================================================
    // Arbitrary Generators
    // ============================================================

    const STATELESS: [&str; 10] = [
        "identity",
        "mixup",
        "cutmix",
        "fmix",
        "resizemix",
        "saliencymix",
        "puzzlemix",
        "transmix",
        "manifoldmix",
        "alignmix",
    ];

    fn arb_pool() -> impl Strategy<Value = BTreeMap<String, PolicySpec>> {
        proptest::sample::subsequence(STATELESS.to_vec(), 1..=STATELESS.len())
            .prop_flat_map(|names| {
                let n = names.len();
                (
                    Just(names),
                    proptest::collection::vec(0.01f32..1.0, n),
                    proptest::collection::vec(0.1f32..4.0, n),
                )
            })
            .prop_map(|(names, weights, alphas)| {
                let total: f32 = weights.iter().sum();
                names
                    .into_iter()
                    .zip(weights)
                    .zip(alphas)
                    .map(|((name, w), alpha)| {
                        let mut params = HashMap::new();
                        if name != "identity" {
                            params.insert("alpha".to_string(), serde_json::json!(alpha));
                        }
                        let spec = PolicySpec {
                            probability: w / total,
                            end_probability: None,
                            params,
                        };
                        (name.to_string(), spec)
                    })
                    .collect()
            })
    }

    fn arb_spec() -> impl Strategy<Value = MixSpec> {
        (arb_pool(), any::<u64>(), any::<bool>()).prop_map(|(policies, seed, strict)| MixSpec {
            seed,
            switch: SwitchMode::Random,
            ramp_steps: None,
            pairing: Default::default(),
            odd_sample: Default::default(),
            label_mode: Default::default(),
            label_rescale: Default::default(),
            two_hot_scale: 1.0,
            strict_budget: strict,
            aliases: BTreeMap::new(),
            policies,
            mix_block: None,
        })
    }

    // ============================================================
    // Properties
    // ============================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_normalized_pools_build(spec in arb_spec()) {
            prop_assert!(validate_config(&spec).is_ok());
            let dispatcher = build_dispatcher(&spec).unwrap();
            prop_assert_eq!(dispatcher.pool().len(), spec.policies.len());
            let total: f32 = dispatcher.weights().iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-4);
        }

        #[test]
        fn prop_yaml_round_trip_still_validates(spec in arb_spec()) {
            let yaml = serde_yaml::to_string(&spec).unwrap();
            let parsed: MixSpec = serde_yaml::from_str(&yaml).unwrap();
            prop_assert_eq!(parsed.seed, spec.seed);
            prop_assert_eq!(
                parsed.policies.keys().collect::<Vec<_>>(),
                spec.policies.keys().collect::<Vec<_>>()
            );
            prop_assert!(validate_config(&parsed).is_ok());
        }

        #[test]
        fn prop_scaled_probabilities_rejected(spec in arb_spec(), scale in 1.1f32..3.0) {
            let mut spec = spec;
            for policy in spec.policies.values_mut() {
                policy.probability = (policy.probability * scale).min(1.0);
            }
            let sum: f32 = spec.policies.values().map(|p| p.probability).sum();
            prop_assume!((sum - 1.0).abs() > 1e-2);
            let rejected = matches!(
                validate_config(&spec),
                Err(ValidationError::ProbabilitySum { .. })
            );
            prop_assert!(rejected);
        }

        #[test]
        fn prop_unregistered_name_rejected(spec in arb_spec(), name in "[a-z]{3,10}x") {
            let mut spec = spec;
            prop_assume!(!PolicyRegistry::with_builtins().contains(&name));
            spec.policies.insert(
                name.clone(),
                PolicySpec { probability: 0.0, end_probability: None, params: HashMap::new() },
            );
            let rejected = matches!(
                validate_config(&spec),
                Err(ValidationError::UnknownPolicy(ref n)) if *n == name
            );
            prop_assert!(rejected);
        }
    }
}
