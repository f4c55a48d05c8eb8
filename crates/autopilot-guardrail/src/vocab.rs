//! Curated vocabularies for the allow/block classifier.
//!
//! Terms are matched as case-insensitive whole words; plural forms are
//! distinct terms on purpose so the lists stay auditable.

/// Salon-related terms. A query mentioning any of these counts toward the
/// allow side of the decision.
pub const ALLOWED_TOPICS: &[&str] = &[
    // Core salon services
    "haircut",
    "hair",
    "styling",
    "color",
    "treatment",
    "spa",
    "facial",
    "makeup",
    "bridal",
    "groom",
    "beard",
    "shave",
    "manicure",
    "pedicure",
    "waxing",
    "threading",
    "keratin",
    "rebonding",
    "smoothening",
    "highlights",
    "lowlights",
    "blowout",
    "curls",
    "straightening",
    "perm",
    "balayage",
    // Booking & scheduling
    "booking",
    "appointment",
    "schedule",
    "availability",
    "slot",
    "time",
    "date",
    "reservation",
    "cancel",
    "reschedule",
    "waitlist",
    "queue",
    "reminder",
    // Business operations
    "service",
    "price",
    "offer",
    "discount",
    "package",
    "stylist",
    "staff",
    "salon",
    "beauty",
    "wellness",
    "loyalty",
    "membership",
    "points",
    "feedback",
    "location",
    "timing",
    "contact",
    "hours",
    // Inventory & products (salon-specific)
    "inventory",
    "product",
    "shampoo",
    "conditioner",
    "serum",
    "oil",
    "cream",
    "gel",
    "spray",
    "mask",
    "reorder",
    "expiry",
    "supply",
    "usage",
    // Customer management
    "customer",
    "client",
    "profile",
    "history",
    "preference",
    "visit",
    "retention",
    "churn",
    "winback",
    "reengage",
    "at-risk",
    "lapsed",
    "active",
    "segment",
    // Pricing & revenue
    "pricing",
    "revenue",
    "demand",
    "peak",
    "off-peak",
    "festival",
    "seasonal",
    "bundle",
    "combo",
    "upsell",
    "addon",
    "upgrade",
    "promotion",
    "campaign",
    // Staff management
    "shift",
    "roster",
    "overtime",
    "time-off",
    "skill",
    "assignment",
    // Analytics (salon context)
    "analytics",
    "report",
    "dashboard",
    "metric",
    "kpi",
    "performance",
    "trend",
    "forecast",
    "analysis",
    // Common greetings and help
    "hello",
    "hi",
    "hey",
    "namaste",
    "assist",
    "thank",
    "please",
    "sorry",
    "welcome",
];

/// Off-domain terms. A query mentioning these with no salon terms (or more
/// of these than salon terms) is rejected.
pub const BLOCKED_TOPICS: &[&str] = &[
    // Politics & current events
    "politics",
    "election",
    "government",
    "minister",
    "party",
    "democracy",
    "vote",
    "policy",
    // Sports
    "cricket",
    "football",
    "soccer",
    "tennis",
    "basketball",
    "sports",
    "match",
    "game",
    "score",
    "team",
    "player",
    "ipl",
    "world cup",
    "olympics",
    // Entertainment
    "movie",
    "film",
    "actor",
    "actress",
    "celebrity",
    "bollywood",
    "hollywood",
    "music",
    "song",
    "concert",
    "netflix",
    "amazon prime",
    "tv show",
    // News & weather
    "news",
    "weather",
    "climate",
    "temperature",
    "forecast",
    "earthquake",
    "flood",
    "storm",
    // Technology & programming
    "programming",
    "coding",
    "python",
    "javascript",
    "java",
    "software",
    "app development",
    "website",
    "database",
    "api",
    "server",
    "cloud",
    "docker",
    "kubernetes",
    "machine learning",
    "artificial intelligence",
    "code",
    "write code",
    "program",
    "developer",
    // Finance (non-salon)
    "stock market",
    "investment",
    "trading",
    "bitcoin",
    "cryptocurrency",
    "crypto",
    "forex",
    "banking",
    "loan",
    "insurance",
    "tax",
    "stock",
    "price of bitcoin",
    // Other unrelated
    "cooking",
    "recipe",
    "restaurant",
    "cook",
    "biryani",
    "curry",
    "travel",
    "vacation",
    "flight",
    "hotel",
    "religion",
    "god",
    "temple",
    "church",
    "mosque",
    "education",
    "school",
    "college",
    "university",
    "medicine",
    "doctor",
    "hospital",
    "disease",
];
