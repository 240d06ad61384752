use rand_distr::StandardNormal;
use rand::Rng;

use crate::key::Key;
use crate::tree::{ParamTree, TreeError};

/// How [`jitter_init`] places a chain's starting point around the template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// `template + spread + z * spread`: the starting points are centred one
    /// spread away from the template.
    #[default]
    SpreadOffset,
    /// `template + z * spread`.
    Centered,
}

/// A randomly perturbed copy of `template`, with `z ~ N(0, 1)` drawn
/// independently for every scalar.
///
/// `key` is split into one key per leaf, in flattening order. Without a
/// `spread` the template is returned unchanged. `spread` must have the
/// structure of `template`.
pub fn jitter_init(
    key: Key,
    template: &ParamTree,
    spread: Option<&ParamTree>,
    mode: JitterMode,
) -> Result<ParamTree, TreeError> {
    let zeros;
    let spread = match spread {
        Some(spread) => spread,
        None => {
            zeros = template.zeros_like();
            &zeros
        }
    };

    let leaf_keys = key.split(template.num_leaves());
    let mut idx = 0;
    template.try_zip_map(spread, |template, spread| {
        let mut rng = leaf_keys[idx].rng();
        idx += 1;
        let values = template
            .values()
            .iter()
            .zip(spread.values())
            .map(|(&t, &s)| {
                let z: f64 = rng.sample(StandardNormal);
                match mode {
                    JitterMode::SpreadOffset => t + s + z * s,
                    JitterMode::Centered => t + z * s,
                }
            })
            .collect();
        Ok(template.with_values(values))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn template() -> ParamTree {
        ParamTree::map([
            ("mu", ParamTree::scalar(2.)),
            ("theta", ParamTree::vector(vec![0.; 4])),
        ])
    }

    #[test]
    fn zero_spread_keeps_template() {
        let template = template();
        for mode in [JitterMode::SpreadOffset, JitterMode::Centered] {
            assert_eq!(jitter_init(Key::new(1), &template, None, mode).unwrap(), template);
            let zeros = template.zeros_like();
            assert_eq!(
                jitter_init(Key::new(2), &template, Some(&zeros), mode).unwrap(),
                template
            );
        }
    }

    #[test]
    fn modes_differ_by_the_spread() {
        let template = template();
        let spread = template.map_leaves(|leaf| leaf.with_values(vec![0.5; leaf.len()]));
        let offset = jitter_init(Key::new(5), &template, Some(&spread), JitterMode::SpreadOffset)
            .unwrap()
            .flatten()
            .0;
        let centered = jitter_init(Key::new(5), &template, Some(&spread), JitterMode::Centered)
            .unwrap()
            .flatten()
            .0;
        for (a, b) in offset.iter().zip(&centered) {
            assert_abs_diff_eq!(a - b, 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn jitter_is_deterministic_per_key() {
        let template = template();
        let spread = template.map_leaves(|leaf| leaf.with_values(vec![1.; leaf.len()]));
        let a = jitter_init(Key::new(9), &template, Some(&spread), JitterMode::default()).unwrap();
        let b = jitter_init(Key::new(9), &template, Some(&spread), JitterMode::default()).unwrap();
        let c = jitter_init(Key::new(10), &template, Some(&spread), JitterMode::default()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.treedef(), template.treedef());
    }

    #[test]
    fn mismatched_spread_fails() {
        let spread = ParamTree::map([("mu", ParamTree::scalar(1.))]);
        assert!(matches!(
            jitter_init(Key::new(0), &template(), Some(&spread), JitterMode::Centered),
            Err(TreeError::StructureMismatch { .. })
        ));
    }
}
