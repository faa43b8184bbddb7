//! Routing of committed changes to product-specific receivers.

use std::fmt;

use crate::path::ConfigPath;
use crate::repository::{Change, ChangeSet, RepositorySnapshot};

/// Selects the paths a receiver is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductMatcher {
    /// Matches any path whose product is listed.
    Products(Vec<String>),
    /// Matches every path.
    Any,
}

impl ProductMatcher {
    pub fn products<I, S>(products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProductMatcher::Products(products.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, path: &ConfigPath) -> bool {
        match self {
            ProductMatcher::Products(products) => products.iter().any(|p| p == path.product()),
            ProductMatcher::Any => true,
        }
    }
}

type Callback = Box<dyn Fn(&RepositorySnapshot, &[&Change]) + Send + Sync>;

/// A callback invoked with the changes matching its product filter.
pub struct Receiver {
    matcher: ProductMatcher,
    callback: Callback,
}

impl Receiver {
    pub fn new<F>(matcher: ProductMatcher, callback: F) -> Self
    where
        F: Fn(&RepositorySnapshot, &[&Change]) + Send + Sync + 'static,
    {
        Self {
            matcher,
            callback: Box::new(callback),
        }
    }

    pub fn matcher(&self) -> &ProductMatcher {
        &self.matcher
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Fans committed change sets out to registered receivers.
#[derive(Debug, Default)]
pub struct Dispatcher {
    receivers: Vec<Receiver>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, receiver: Receiver) {
        self.receivers.push(receiver);
    }

    /// Products any receiver subscribes to, deduplicated in registration order.
    pub fn products(&self) -> Vec<String> {
        let mut products: Vec<String> = Vec::new();
        for receiver in &self.receivers {
            if let ProductMatcher::Products(list) = &receiver.matcher {
                for product in list {
                    if !products.contains(product) {
                        products.push(product.clone());
                    }
                }
            }
        }
        products
    }

    /// Invokes each receiver once with its matching changes, skipping receivers with none.
    pub fn dispatch(&self, changes: &ChangeSet, snapshot: &RepositorySnapshot) {
        for receiver in &self.receivers {
            let matching: Vec<&Change> = changes
                .iter()
                .filter(|change| receiver.matcher.matches(change.path()))
                .collect();
            if !matching.is_empty() {
                (receiver.callback)(snapshot, &matching);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Content, TargetFile};
    use crate::digest::DigestList;
    use crate::repository::Repository;
    use crate::targets::Target;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn insert_all(repository: &Repository, paths: &[&str]) -> ChangeSet {
        repository
            .transaction(|_, txn| {
                for raw in paths {
                    let content = Content::parse(
                        TargetFile {
                            path: raw.to_string(),
                            raw: b"{}".to_vec(),
                        },
                        None,
                    )
                    .unwrap();
                    txn.insert(
                        ConfigPath::parse(raw).unwrap(),
                        Target::new(2, DigestList::default(), 1),
                        Arc::new(content),
                    );
                }
                Ok::<_, Infallible>(())
            })
            .unwrap()
    }

    /// Receivers only see changes for their products.
    #[test]
    fn dispatch_filters_by_product() {
        let repository = Repository::new();
        let changes = insert_all(
            &repository,
            &[
                "employee/ASM_DD/rules/config",
                "datadog/1/ASM_DATA/blocked/config",
                "datadog/1/LIVE_DEBUGGING/probe/config",
            ],
        );

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        {
            let seen = seen.clone();
            dispatcher.register(Receiver::new(
                ProductMatcher::products(["ASM_DD", "ASM_DATA"]),
                move |_, changes| {
                    seen.lock()
                        .unwrap()
                        .extend(changes.iter().map(|c| c.path().to_string()));
                },
            ));
        }
        {
            let calls = calls.clone();
            dispatcher.register(Receiver::new(
                ProductMatcher::products(["APM_TRACING"]),
                move |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        dispatcher.dispatch(&changes, &repository.snapshot());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "employee/ASM_DD/rules/config".to_string(),
                "datadog/1/ASM_DATA/blocked/config".to_string()
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            dispatcher.products(),
            vec!["ASM_DD".to_string(), "ASM_DATA".to_string(), "APM_TRACING".to_string()]
        );
    }

    /// The catch-all matcher sees everything.
    #[test]
    fn any_matcher_matches_everything() {
        let path = ConfigPath::parse("employee/WHATEVER/x/config").unwrap();
        assert!(ProductMatcher::Any.matches(&path));
        assert!(!ProductMatcher::products(["ASM"]).matches(&path));
    }
}
