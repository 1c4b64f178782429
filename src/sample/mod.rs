use crate::core::TokenId;
use crate::error::{Error, Result};
use crate::rng::SeededRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// `<= 0` selects the most likely token.
    pub temperature: f32,
    /// `0` disables the top-k cut.
    pub top_k: usize,
    pub top_p: f32,
    pub repeat_penalty: f32,
    /// How many trailing tokens of the history the penalty looks at.
    pub repeat_last_n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.10,
            repeat_last_n: 64,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            repeat_penalty: 1.0,
            repeat_last_n: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() {
            return Err(Error::Config(format!("temperature {} is not finite", self.temperature)));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Config(format!("top_p {} outside (0, 1]", self.top_p)));
        }
        if !(self.repeat_penalty.is_finite() && self.repeat_penalty > 0.0) {
            return Err(Error::Config(format!("repeat_penalty {} must be positive", self.repeat_penalty)));
        }
        Ok(())
    }
}

/// Turns a logit vector into one token: repetition penalty, temperature,
/// top-k, softmax, top-p, then a draw from the caller's generator.
pub struct Sampler<'a> {
    params: &'a SamplingParams,
}

impl<'a> Sampler<'a> {
    pub fn new(params: &'a SamplingParams) -> Self {
        Self { params }
    }

    pub fn sample(&self, logits: &[f32], recent: &[TokenId], rng: &mut SeededRng) -> Result<TokenId> {
        if logits.is_empty() {
            return Err(Error::NotReady);
        }

        let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
        self.apply_repeat_penalty(&mut candidates, recent);

        if self.params.temperature <= 0.0 {
            return Ok(Self::argmax(&candidates));
        }

        for (_, logit) in candidates.iter_mut() {
            *logit /= self.params.temperature;
        }

        // Descending by logit; equal logits keep the lower id first so the
        // order never depends on the sort implementation.
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        if self.params.top_k > 0 {
            candidates.truncate(self.params.top_k);
        }

        let max = candidates[0].1;
        let mut probs: Vec<f64> = candidates
            .iter()
            .map(|&(_, l)| ((l - max) as f64).exp())
            .collect();
        let sum: f64 = probs.iter().sum();
        for p in probs.iter_mut() {
            *p /= sum;
        }

        if self.params.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, &p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.params.top_p as f64 {
                    keep = i + 1;
                    break;
                }
            }
            probs.truncate(keep);
        }

        let total: f64 = probs.iter().sum();
        let r = rng.next_f64() * total;
        let mut cumulative = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if r < cumulative {
                return Ok(TokenId(candidates[i].0 as i32));
            }
        }

        Ok(TokenId(candidates[probs.len() - 1].0 as i32))
    }

    fn apply_repeat_penalty(&self, candidates: &mut [(usize, f32)], recent: &[TokenId]) {
        let penalty = self.params.repeat_penalty;
        if penalty == 1.0 || recent.is_empty() {
            return;
        }

        let mut seen: Vec<usize> = recent.iter().filter_map(TokenId::index).collect();
        seen.sort_unstable();
        seen.dedup();

        for id in seen {
            if let Some((_, logit)) = candidates.get_mut(id) {
                if *logit < 0.0 {
                    *logit *= penalty;
                } else {
                    *logit /= penalty;
                }
            }
        }
    }

    fn argmax(candidates: &[(usize, f32)]) -> TokenId {
        let mut best = candidates[0];
        for &c in &candidates[1..] {
            if c.1 > best.1 {
                best = c;
            }
        }
        TokenId(best.0 as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_picks_max() {
        let params = SamplingParams::greedy();
        let mut rng = SeededRng::new(1);
        let token = Sampler::new(&params).sample(&[0.1, 2.0, 2.0, -1.0], &[], &mut rng).unwrap();
        assert_eq!(token, TokenId(1));
        assert_eq!(rng, SeededRng::new(1));
    }

    #[test]
    fn test_repeat_penalty_shifts_choice() {
        let params = SamplingParams {
            repeat_penalty: 2.0,
            ..SamplingParams::greedy()
        };
        let mut rng = SeededRng::new(1);
        let logits = [1.0, 1.5, -3.0];

        let token = Sampler::new(&params).sample(&logits, &[TokenId(1)], &mut rng).unwrap();
        assert_eq!(token, TokenId(0));
    }

    #[test]
    fn test_top_k_one_is_deterministic() {
        let params = SamplingParams {
            top_k: 1,
            ..SamplingParams::default()
        };
        for seed in 0..8 {
            let mut rng = SeededRng::new(seed);
            let token = Sampler::new(&params).sample(&[0.0, 0.5, 3.0], &[], &mut rng).unwrap();
            assert_eq!(token, TokenId(2));
        }
    }

    #[test]
    fn test_same_seed_same_draw() {
        let params = SamplingParams {
            top_p: 1.0,
            ..SamplingParams::default()
        };
        let logits: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();

        let draw = |seed| {
            let mut rng = SeededRng::new(seed);
            (0..10)
                .map(|_| Sampler::new(&params).sample(&logits, &[], &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(9), draw(9));
    }

    #[test]
    fn test_empty_logits_not_ready() {
        let params = SamplingParams::default();
        let mut rng = SeededRng::new(0);
        assert!(matches!(
            Sampler::new(&params).sample(&[], &[], &mut rng),
            Err(Error::NotReady)
        ));
    }

    #[test]
    fn test_validate() {
        assert!(SamplingParams::default().validate().is_ok());
        let bad = SamplingParams { top_p: 0.0, ..SamplingParams::default() };
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }
}
