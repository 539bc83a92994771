//! Kernel template rendering and specialization keys.
//!
//! Kernel sources are parameterized with `@name@` placeholders and rendered
//! once per specialization tuple. The rendered source is what a backend
//! compiles; [`KernelKey`] is the compile-once cache key. The key space is
//! bounded by model configuration, so the cache never evicts.

use std::collections::HashMap;

use crate::kernel_types::{ElementType, KernelError, KernelResult, KernelSpec, ReduceStrategy};

/// The three kernel flavors sharing the common index scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelFlavor {
    /// Forward scatter into per-expert buffers.
    Dispatch,
    /// Backward gather w.r.t. the input rows.
    CombineGrad,
    /// Backward reduction w.r.t. the routing weight.
    GateGrad,
}

impl KernelFlavor {
    pub const fn name(self) -> &'static str {
        match self {
            KernelFlavor::Dispatch => "moe_dispatch",
            KernelFlavor::CombineGrad => "moe_combine_grad",
            KernelFlavor::GateGrad => "moe_gate_grad",
        }
    }
}

/// Full specialization tuple identifying one compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub flavor: KernelFlavor,
    pub element: ElementType,
    pub samples: usize,
    pub hidden: usize,
    pub capacity: usize,
    /// Only the gate-gradient flavor carries a reduction strategy.
    pub strategy: Option<ReduceStrategy>,
}

impl KernelKey {
    pub fn new(flavor: KernelFlavor, element: ElementType, spec: &KernelSpec) -> Self {
        KernelKey {
            flavor,
            element,
            samples: spec.samples,
            hidden: spec.hidden,
            capacity: spec.capacity,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ReduceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Scalar parameters substituted into the kernel template.
    pub fn template_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("samples", self.samples.to_string()),
            ("hidden", self.hidden.to_string()),
            ("capacity", self.capacity.to_string()),
            ("dtype", self.element.cuda_name().to_string()),
            ("scalar_t", self.element.cuda_scalar_name().to_string()),
            (
                "IS_FLOAT",
                if self.element.is_float() { "1" } else { "0" }.to_string(),
            ),
        ];
        if let Some(strategy) = self.strategy {
            let shuffle = matches!(strategy, ReduceStrategy::LaneShuffle);
            params.push(("USE_LANE_SHUFFLE", if shuffle { "1" } else { "0" }.to_string()));
        }
        params
    }
}

/// Substitute every `@name@` placeholder in `source`.
///
/// Fails if a placeholder survives rendering: an unbound parameter must
/// never reach the device compiler, where it would surface as an opaque
/// syntax error.
pub fn render_template(source: &str, params: &[(&str, String)]) -> KernelResult<String> {
    let map: HashMap<&str, &str> = params
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect();

    let mut rendered = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find('@') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('@') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = map.get(name) {
                    rendered.push_str(value);
                    rest = &after[end + 1..];
                } else if is_placeholder_name(name) {
                    return Err(KernelError::UnboundPlaceholder(name.to_string()));
                } else {
                    // A stray '@' that is not a placeholder (e.g. inside a
                    // comment); keep it and continue after it.
                    rendered.push('@');
                    rest = after;
                }
            }
            None => {
                rendered.push('@');
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> KernelSpec {
        KernelSpec::new(4, 8, 2, 2).unwrap()
    }

    #[test]
    fn renders_all_placeholders() {
        let key = KernelKey::new(KernelFlavor::Dispatch, ElementType::F32, &spec());
        let source = "#define samples (@samples@)\n#define hidden (@hidden@)\ntypedef @dtype@ T;";
        let rendered = render_template(source, &key.template_params()).unwrap();
        assert_eq!(
            rendered,
            "#define samples (4)\n#define hidden (8)\ntypedef float T;"
        );
    }

    #[test]
    fn rejects_unbound_placeholder() {
        let err = render_template("@capacity@ @unknown_param@", &[("capacity", "2".into())])
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::UnboundPlaceholder(ref name) if name == "unknown_param"
        ));
    }

    #[test]
    fn keeps_non_placeholder_at_signs() {
        let rendered = render_template("a @ b @ c", &[]).unwrap();
        assert_eq!(rendered, "a @ b @ c");
    }

    #[test]
    fn half_specialization_params() {
        let key = KernelKey::new(KernelFlavor::GateGrad, ElementType::F16x2, &spec())
            .with_strategy(ReduceStrategy::SharedScratch);
        let params = key.template_params();
        let lookup = |name: &str| {
            params
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(lookup("dtype"), "__half2");
        assert_eq!(lookup("scalar_t"), "__half");
        assert_eq!(lookup("IS_FLOAT"), "0");
        assert_eq!(lookup("USE_LANE_SHUFFLE"), "0");
    }

    #[test]
    fn keys_distinguish_every_field() {
        use std::collections::HashSet;

        let base = KernelKey::new(KernelFlavor::Dispatch, ElementType::F32, &spec());
        let mut keys = HashSet::new();
        keys.insert(base);
        keys.insert(KernelKey {
            flavor: KernelFlavor::CombineGrad,
            ..base
        });
        keys.insert(KernelKey {
            element: ElementType::F16x2,
            ..base
        });
        keys.insert(KernelKey {
            capacity: base.capacity + 1,
            ..base
        });
        keys.insert(base.with_strategy(ReduceStrategy::LaneShuffle));
        keys.insert(base.with_strategy(ReduceStrategy::SharedScratch));
        assert_eq!(keys.len(), 6);
    }
}
