//! Domain confinement for the agent pipeline.
//!
//! Every customer-facing request is classified before it can reach the LLM:
//! a term-counting decision over two curated vocabularies, compiled into
//! case-insensitive whole-word patterns at construction. The guardrail is
//! purely in-memory and side-effect-free; the pattern tables are immutable
//! after startup.

use regex::Regex;
use tracing::{info, warn};

mod vocab;

pub use vocab::{ALLOWED_TOPICS, BLOCKED_TOPICS};

/// Localized rejection prefixes. English is the fallback.
const REJECTION_EN: &str = "I'm your salon assistant! I can only help with salon services, \
bookings, and beauty-related queries. How can I assist you with your salon needs today?";
const REJECTION_HI: &str = "मैं आपका सैलून असिस्टेंट हूं! मैं केवल सैलून सेवाओं, बुकिंग और ब्यूटी संबंधी queries में मदद \
कर सकता हूं। आज मैं आपकी सैलून जरूरतों में कैसे मदद कर सकता हूं?";
const REJECTION_TE: &str = "నేను మీ సెలూన్ అసిస్టెంట్! నేను సెలూన్ సేవలు, బుకింగ్‌లు మరియు అందం సంబంధిత ప్రశ్నలలో \
మాత్రమే సహాయం చేయగలను. ఈరోజు మీ సెలూన్ అవసరాలలో నేను ఎలా సహాయం చేయగలను?";

const REDIRECT_MESSAGE: &str = "\n\nI can help you with:\n\
- Booking appointments\n\
- Service information and pricing\n\
- Stylist recommendations\n\
- Offers and packages\n\
- Loyalty points and memberships\n\n\
How can I help you today?";

const SYSTEM_PROMPT_SUFFIX: &str = "\nIMPORTANT: You are a salon assistant ONLY. You must:\n\
1. ONLY respond to queries related to salon services, beauty, hair, and wellness\n\
2. Politely decline any questions about politics, sports, news, technology, or unrelated topics\n\
3. Redirect users back to salon services with helpful suggestions\n\
4. Never provide information outside your salon expertise\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct Validation {
    pub verdict: Verdict,
    pub reason: String,
}

impl Validation {
    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

/// Allow/block classifier confining agents to the salon domain.
pub struct Guardrail {
    allowed: Vec<Regex>,
    blocked: Vec<Regex>,
    devanagari: Regex,
    telugu: Regex,
}

impl Guardrail {
    pub fn new() -> Self {
        Self {
            allowed: compile_word_patterns(ALLOWED_TOPICS),
            blocked: compile_word_patterns(BLOCKED_TOPICS),
            devanagari: Regex::new(r"[ऀ-ॿ]").expect("static pattern"),
            telugu: Regex::new(r"[ఀ-౿]").expect("static pattern"),
        }
    }

    /// Classify a query.
    ///
    /// Rules, in order: empty rejects; one or two words accept (greetings
    /// and acks pass); block-only rejects; blocked > allowed rejects;
    /// everything else accepts. Ambiguous queries with no hits on either
    /// vocabulary accept — recall is favored inside the allowed domain.
    pub fn validate(&self, query: &str) -> Validation {
        if query.trim().is_empty() {
            return Validation {
                verdict: Verdict::Reject,
                reason: "empty query".to_string(),
            };
        }

        if query.split_whitespace().count() <= 2 {
            return Validation {
                verdict: Verdict::Accept,
                reason: "short query allowed".to_string(),
            };
        }

        let allowed = count_matches(&self.allowed, query);
        let blocked = count_matches(&self.blocked, query);

        if blocked > 0 && allowed == 0 {
            let reason = format!("blocked topics detected: {blocked}, no salon topics");
            warn!(query_preview = preview(query), %reason, "guardrail_blocked_query");
            return Validation {
                verdict: Verdict::Reject,
                reason,
            };
        }

        if allowed > 0 {
            if blocked > allowed {
                let reason = format!("blocked topics ({blocked}) > allowed topics ({allowed})");
                warn!(query_preview = preview(query), %reason, "guardrail_blocked_query");
                return Validation {
                    verdict: Verdict::Reject,
                    reason,
                };
            }
            return Validation {
                verdict: Verdict::Accept,
                reason: format!("salon-related query (topics: {allowed})"),
            };
        }

        info!(query_preview = preview(query), "guardrail_ambiguous");
        Validation {
            verdict: Verdict::Accept,
            reason: "ambiguous but allowed".to_string(),
        }
    }

    /// Unicode-script language sniff: Devanagari → hi, Telugu → te, else en.
    pub fn detect_language(&self, text: &str) -> &'static str {
        if self.devanagari.is_match(text) {
            return "hi";
        }
        if self.telugu.is_match(text) {
            return "te";
        }
        "en"
    }

    /// Localized rejection body: language-specific prefix plus the fixed
    /// redirect menu.
    pub fn rejection_response(&self, language: &str) -> String {
        let prefix = match language {
            "hi" => REJECTION_HI,
            "te" => REJECTION_TE,
            _ => REJECTION_EN,
        };
        format!("{prefix}{REDIRECT_MESSAGE}")
    }

    pub fn rejection_for_query(&self, query: &str) -> String {
        self.rejection_response(self.detect_language(query))
    }

    /// Immutable instruction appended to every agent system prompt.
    pub fn system_prompt_suffix(&self) -> &'static str {
        SYSTEM_PROMPT_SUFFIX
    }
}

impl Default for Guardrail {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_word_patterns(topics: &[&str]) -> Vec<Regex> {
    topics
        .iter()
        .map(|topic| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(topic))).expect("static pattern")
        })
        .collect()
}

fn count_matches(patterns: &[Regex], query: &str) -> usize {
    patterns.iter().filter(|p| p.is_match(query)).count()
}

fn preview(query: &str) -> &str {
    let end = query
        .char_indices()
        .nth(100)
        .map_or(query.len(), |(idx, _)| idx);
    &query[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail() -> Guardrail {
        Guardrail::new()
    }

    const ACCEPT_FIXTURES: &[&str] = &[
        "I want to book a haircut appointment for tomorrow",
        "What is the price of a keratin treatment?",
        "Can I reschedule my facial appointment to Saturday",
        "Do you have any bridal makeup packages available",
        "Which stylist is free for hair color this evening",
        "Show me the loyalty points on my membership",
        "Is there a discount offer on manicure and pedicure",
        "I need waxing and threading before the weekend",
        "What are the salon hours on Sunday please",
        "Can you recommend a treatment for damaged hair",
        "My beard trim appointment needs to be cancelled",
        "Are highlights and balayage done by the same stylist",
        "Put me on the waitlist for a spa session",
        "How much does hair smoothening cost here",
        "I want to give feedback about my last visit",
        "When is the next slot available for a blowout",
        "Book a groom package for the wedding next month",
        "Does the membership include free threading sessions",
        "Which shampoo do you use for keratin treated hair",
        "Please send me a reminder for my appointment",
        "What combo packages are there for hair and facial",
        "Can I buy the serum you used last time",
        "Is the pedicure chair free right now",
        "Tell me about the festival offer on spa packages",
        "I would like a rebonding session with Anjali",
        "Show my visit history and preferences",
        "What addon services go well with a facial",
        "My daughter needs a haircut before school opens",
        "Are walk-in appointments possible for eyebrow threading",
        "How many loyalty points do I need for a free facial",
        "क्या कल के लिए haircut appointment मिल सकती है",
        "मुझे facial और threading की booking करनी है",
        "సెలూన్ లో haircut appointment కావాలి",
        "నాకు facial booking చేయాలి దయచేసి slot చెప్పండి",
    ];

    const REJECT_FIXTURES: &[&str] = &[
        "who won the ipl match yesterday evening",
        "tell me the latest cricket score please",
        "what is the weather forecast for tomorrow",
        "explain how to write python code for sorting",
        "which party will win the election this year",
        "what is the price of bitcoin right now",
        "recommend a good movie on netflix tonight",
        "how do I cook chicken biryani at home",
        "what are the best stocks for investment now",
        "tell me about the football world cup final",
        "how does machine learning actually work inside",
        "which actor starred in that bollywood film",
        "give me a recipe for paneer butter curry",
        "what is the capital gains tax on shares",
        "how to build a website with javascript quickly",
        "who is the prime minister of the government",
        "is there an earthquake warning in the news",
        "suggest a vacation destination with cheap flights",
        "explain cryptocurrency trading for beginners please",
        "what time is the tennis match on tv",
        "how do I apply for a bank loan online",
        "tell me about the new song from that concert",
        "what disease causes fever and should I see a doctor",
        "recommend a good college for engineering education",
        "how to deploy an app on kubernetes cluster",
        "what is the temperature in delhi right now",
        "give me the basketball game score from last night",
        "which insurance policy is best for my car",
        "how do I fix a bug in my java program",
        "which temple of god is famous in the city",
    ];

    #[test]
    fn accept_fixtures_pass() {
        let g = guardrail();
        for query in ACCEPT_FIXTURES {
            let v = g.validate(query);
            assert!(v.is_accept(), "expected accept for `{query}`: {}", v.reason);
        }
    }

    #[test]
    fn reject_fixtures_fail() {
        let g = guardrail();
        for query in REJECT_FIXTURES {
            let v = g.validate(query);
            assert!(!v.is_accept(), "expected reject for `{query}`: {}", v.reason);
        }
    }

    #[test]
    fn short_inputs_always_accept() {
        let g = guardrail();
        for query in ["hi", "yes", "thank you", "ok", "namaste", "no thanks"] {
            assert!(g.validate(query).is_accept(), "short input `{query}`");
        }
    }

    #[test]
    fn empty_input_rejects() {
        let g = guardrail();
        assert!(!g.validate("").is_accept());
        assert!(!g.validate("   \t ").is_accept());
    }

    #[test]
    fn mixed_query_rejects_when_blocked_dominates() {
        let g = guardrail();
        // one salon term, two blocked terms
        let v = g.validate("book cricket match tickets and football game passes");
        assert!(!v.is_accept());
    }

    #[test]
    fn mixed_query_accepts_when_salon_dominates() {
        let g = guardrail();
        let v = g.validate("book a haircut and facial appointment before the match");
        assert!(v.is_accept());
    }

    #[test]
    fn language_detection_uses_scripts() {
        let g = guardrail();
        assert_eq!(g.detect_language("book a haircut"), "en");
        assert_eq!(g.detect_language("मुझे booking करनी है"), "hi");
        assert_eq!(g.detect_language("నాకు booking కావాలి"), "te");
    }

    #[test]
    fn rejection_response_is_localized_with_redirect() {
        let g = guardrail();
        for lang in ["en", "hi", "te", "fr"] {
            let body = g.rejection_response(lang);
            assert!(body.contains("Booking appointments"), "lang {lang}");
        }
        assert!(g.rejection_response("hi").contains("सैलून"));
        assert!(g.rejection_response("te").contains("సెలూన్"));
        assert!(g.rejection_response("fr").starts_with("I'm your salon assistant"));
    }

    #[test]
    fn system_prompt_suffix_is_stable() {
        let g = guardrail();
        assert!(g.system_prompt_suffix().contains("salon assistant ONLY"));
    }
}
