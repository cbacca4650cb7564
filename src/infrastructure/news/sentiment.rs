//! VADER-based headline sentiment with equity-market keyword boosting. Feeds
//! the catalyst score of the news stage.

use vader_sentiment::SentimentIntensityAnalyzer;

/// Financial phrases VADER's general lexicon underweights, with boost values.
const BULLISH_KEYWORDS: &[(&str, f64)] = &[
    ("beats estimates", 0.5),
    ("beats expectations", 0.5),
    ("raises guidance", 0.5),
    ("upgraded", 0.4),
    ("upgrade", 0.3),
    ("price target raised", 0.4),
    ("record revenue", 0.4),
    ("record earnings", 0.4),
    ("surge", 0.4),
    ("surges", 0.4),
    ("rally", 0.4),
    ("rallies", 0.4),
    ("soar", 0.5),
    ("soars", 0.5),
    ("breakout", 0.3),
    ("all-time high", 0.5),
    ("buyback", 0.3),
    ("acquisition", 0.2),
    ("fda approval", 0.6),
    ("contract win", 0.4),
    ("partnership", 0.2),
];

const BEARISH_KEYWORDS: &[(&str, f64)] = &[
    ("misses estimates", -0.5),
    ("misses expectations", -0.5),
    ("cuts guidance", -0.5),
    ("lowers guidance", -0.5),
    ("downgraded", -0.4),
    ("downgrade", -0.3),
    ("price target cut", -0.4),
    ("plunge", -0.5),
    ("plunges", -0.5),
    ("crash", -0.5),
    ("sell-off", -0.4),
    ("selloff", -0.4),
    ("lawsuit", -0.4),
    ("investigation", -0.4),
    ("sec probe", -0.5),
    ("recall", -0.4),
    ("bankruptcy", -0.7),
    ("chapter 11", -0.7),
    ("dilution", -0.4),
    ("offering", -0.3),
    ("halted", -0.4),
];

pub struct SentimentAnalyzer {
    analyzer: SentimentIntensityAnalyzer<'static>,
}

impl SentimentAnalyzer {
    pub fn new() -> Self {
        Self {
            analyzer: SentimentIntensityAnalyzer::new(),
        }
    }

    fn keyword_boost(&self, text: &str) -> f64 {
        let lowered = text.to_lowercase();
        let mut boost = 0.0;
        for (keyword, score) in BULLISH_KEYWORDS {
            if lowered.contains(keyword) {
                boost += score;
            }
        }
        for (keyword, score) in BEARISH_KEYWORDS {
            if lowered.contains(keyword) {
                boost += score;
            }
        }
        boost
    }

    /// Sentiment in [-1, 1]. VADER compound plus half the keyword boost.
    pub fn analyze(&self, text: &str) -> f64 {
        if text.trim().is_empty() {
            return 0.0;
        }
        let scores = self.analyzer.polarity_scores(text);
        let vader = scores["compound"];
        (vader + self.keyword_boost(text) * 0.5).clamp(-1.0, 1.0)
    }

    /// Title weighted 70%, summary 30%.
    pub fn analyze_headline(&self, title: &str, summary: &str) -> f64 {
        self.analyze(title) * 0.7 + self.analyze(summary) * 0.3
    }

    /// Fold sentiment in [-1, 1] into a stage score in [0, 1].
    pub fn to_stage_score(sentiment: f64) -> f64 {
        ((sentiment + 1.0) / 2.0).clamp(0.0, 1.0)
    }
}

impl Default for SentimentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earnings_beats_read_bullish() {
        let analyzer = SentimentAnalyzer::new();
        for headline in [
            "Acme beats estimates and raises guidance for the full year",
            "Shares surge after record revenue quarter",
            "Biotech soars on FDA approval of lead drug",
        ] {
            assert!(
                analyzer.analyze(headline) > 0.0,
                "expected bullish for '{headline}'"
            );
        }
    }

    #[test]
    fn guidance_cuts_read_bearish() {
        let analyzer = SentimentAnalyzer::new();
        for headline in [
            "Acme misses estimates and cuts guidance",
            "Stock plunges after SEC probe disclosed",
            "Retailer files for chapter 11 bankruptcy protection",
        ] {
            assert!(
                analyzer.analyze(headline) < 0.0,
                "expected bearish for '{headline}'"
            );
        }
    }

    #[test]
    fn empty_text_is_neutral() {
        let analyzer = SentimentAnalyzer::new();
        assert_eq!(analyzer.analyze(""), 0.0);
        assert_eq!(analyzer.analyze("   "), 0.0);
    }

    #[test]
    fn title_dominates_summary() {
        let analyzer = SentimentAnalyzer::new();
        let score = analyzer.analyze_headline(
            "Shares surge to all-time high",
            "The company traded within its usual range for most of the day.",
        );
        assert!(score > 0.0);
    }

    #[test]
    fn stage_score_mapping() {
        assert_eq!(SentimentAnalyzer::to_stage_score(0.0), 0.5);
        assert_eq!(SentimentAnalyzer::to_stage_score(1.0), 1.0);
        assert_eq!(SentimentAnalyzer::to_stage_score(-1.0), 0.0);
    }
}
