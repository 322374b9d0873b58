use crate::spec::ServiceSpec;

/// A manifest with its includes, each already turned into functions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedManifest {
    /// The composed service name every function of this level is prefixed with.
    pub parent: String,
    pub namespace: String,
    pub description: Option<String>,
    pub specs: Vec<ServiceSpec>,
    pub includes: Vec<ResolvedManifest>,
}

impl ResolvedManifest {
    /// All functions of the tree, outer manifests first.
    pub fn flatten(self) -> Vec<ServiceSpec> {
        let mut specs = self.specs;
        for include in self.includes {
            specs.extend(include.flatten());
        }
        specs
    }

    pub fn len(&self) -> usize {
        self.specs.len() + self.includes.iter().map(Self::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn flatten_in_pre_order() {
        let tree = ResolvedManifest {
            parent: "outer".into(),
            specs: vec![spec("outer-a")],
            includes: vec![ResolvedManifest {
                parent: "outer-inner".into(),
                specs: vec![spec("outer-inner-b"), spec("outer-inner-c")],
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(tree.len(), 3);
        let names: Vec<_> = tree.flatten().into_iter().map(|spec| spec.name).collect();
        assert_eq!(names, ["outer-a", "outer-inner-b", "outer-inner-c"]);
    }
}
