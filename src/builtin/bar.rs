//! A trivial fixture for exercising composition.

use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::artifacts::Artifacts;
use crate::config::{ArgKind, ArgumentSpec, Arguments, Namespace};
use crate::error::Result;
use crate::fixture::{Fixture, FixtureCore, FixtureInfo};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Produces an `eat` action and a `bar_<number>` timestamp.
///
/// The timestamp is monotonic seconds, so concurrent bars can be ordered.
pub struct BarFixture {
    core: FixtureCore,
}

impl From<FixtureCore> for BarFixture {
    fn from(core: FixtureCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Fixture for BarFixture {
    fn info() -> FixtureInfo {
        FixtureInfo::new("bar", "bar")
    }

    fn on_visit_test_arguments(arguments: &mut Arguments<'_>) {
        arguments.add_argument(
            ArgumentSpec::new("number")
                .kind(ArgKind::Int)
                .default(0)
                .help("Suffix of the bar_<number> artifact."),
        );
    }

    fn core(&self) -> &FixtureCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FixtureCore {
        &mut self.core
    }

    async fn on_gather(&mut self, namespace: &Namespace) -> Result<Artifacts> {
        let number = namespace.get_i64("number").unwrap_or_default();
        tracing::info!(number, "don't forget to eat your dessert");

        let mut builder = Artifacts::builder();
        builder
            .action("eat", || tracing::info!("bars are yummy"))
            .insert(
                format!("bar_{}", number),
                epoch().elapsed().as_secs_f64(),
            );
        Ok(builder.build(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigContext, Overrides};
    use crate::manager::FixtureManager;

    #[tokio::test]
    async fn bar_produces_eat_and_marker() {
        let manager = FixtureManager::new(ConfigContext::empty()).unwrap();
        let mut bar: BarFixture = manager.instantiate(Overrides::new()).unwrap();

        let artifacts = bar
            .gather(Overrides::new().with("bar_number", 3))
            .await
            .unwrap();
        assert!(artifacts.is_success());
        assert!(artifacts.get_f64("bar_3").is_some());
        assert!(artifacts.invoke("eat"));
    }
}
