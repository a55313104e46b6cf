use super::{decode_params, Transformer};
use crate::error::GatewayError;
use crate::wrapper::ApiWrapper;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Sleeps a uniformly random duration in `[min, max]`. Useful for chaos
/// drills and for slowing abusive callers without rejecting them.
pub struct DelayTransformer {
    min: Duration,
    max: Duration,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    min: String,
    max: String,
}

impl DelayTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        let min = humantime::parse_duration(&params.min)
            .with_context(|| format!("invalid delay min {:?}", params.min))?;
        let max = humantime::parse_duration(&params.max)
            .with_context(|| format!("invalid delay max {:?}", params.max))?;
        if max < min {
            anyhow::bail!("delay max must be >= min");
        }
        Ok(Self {
            min,
            max,
            activate_on_tags,
        })
    }

    fn pick(&self) -> Duration {
        if self.max == self.min {
            return self.min;
        }
        let nanos = rand::thread_rng().gen_range(self.min.as_nanos()..=self.max.as_nanos());
        Duration::from_nanos(nanos as u64)
    }
}

#[async_trait]
impl Transformer for DelayTransformer {
    async fn transform(&self, _wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        tokio::time::sleep(self.pick()).await;
        Ok(())
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::test_wrapper;
    use std::time::Instant;

    #[tokio::test]
    async fn test_delay_within_bounds() {
        let t = DelayTransformer::from_params(
            vec![],
            &serde_yaml::from_str("{min: 10ms, max: 30ms}").unwrap(),
        )
        .unwrap();
        let mut wrapper = test_wrapper();
        let start = Instant::now();
        t.transform(&mut wrapper).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(10));
        // Generous upper bound for scheduler noise.
        assert!(elapsed < Duration::from_millis(300));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        assert!(DelayTransformer::from_params(
            vec![],
            &serde_yaml::from_str("{min: 2s, max: 1s}").unwrap(),
        )
        .is_err());
    }

    #[test]
    fn test_pick_stays_in_range() {
        let t = DelayTransformer::from_params(
            vec![],
            &serde_yaml::from_str("{min: 1s, max: 3s}").unwrap(),
        )
        .unwrap();
        for _ in 0..64 {
            let d = t.pick();
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(3));
        }
    }
}
