//! Deterministic local-only content for when the circles backend is
//! unreachable or returns nothing.

use chrono::{DateTime, TimeDelta, Utc};
use circle_shared::domain::{Circle, CircleId, ServerMessageId, UserId};

use crate::types::{LocalId, Message, MessageOrigin};

// 2024-01-01T00:00:00Z. Seed timestamps are fixed so seeded timelines compare
// equal across runs and always sort before live traffic.
const SEED_ANCHOR_SECS: i64 = 1_704_067_200;

struct SeedLine {
    author: &'static str,
    display_name: &'static str,
    body: &'static str,
    is_anonymous: bool,
}

const CONVERSATIONS: &[&[SeedLine]] = &[
    &[
        SeedLine {
            author: "seed-sarah",
            display_name: "Sarah",
            body: "Hey everyone! Just wanted to share that I finally beat that level we were talking about!",
            is_anonymous: false,
        },
        SeedLine {
            author: "seed-phoenix",
            display_name: "Anonymous Phoenix",
            body: "That's awesome! What strategy did you use?",
            is_anonymous: true,
        },
        SeedLine {
            author: "seed-alex",
            display_name: "Alex",
            body: "Congrats! I'm still stuck on level 15. Any tips?",
            is_anonymous: false,
        },
    ],
    &[
        SeedLine {
            author: "seed-maya",
            display_name: "Maya",
            body: "Exams start next week and I'm trying a new study schedule.",
            is_anonymous: false,
        },
        SeedLine {
            author: "seed-owl",
            display_name: "Anonymous Owl",
            body: "Short breaks every 25 minutes helped me a lot.",
            is_anonymous: true,
        },
        SeedLine {
            author: "seed-jordan",
            display_name: "Jordan",
            body: "Same here. Want to do a check-in tomorrow evening?",
            is_anonymous: false,
        },
    ],
];

struct SeedCircle {
    id: &'static str,
    name: &'static str,
    interest: &'static str,
    members: u32,
    max_members: u32,
    online: u32,
    allows_anonymous: bool,
    description: &'static str,
}

const SEED_CIRCLES: &[SeedCircle] = &[
    SeedCircle {
        id: "1",
        name: "Gaming Buddies",
        interest: "Gaming",
        members: 8,
        max_members: 10,
        online: 3,
        allows_anonymous: false,
        description: "Connect with fellow gamers, share tips, and organize gaming sessions",
    },
    SeedCircle {
        id: "2",
        name: "Exam Warriors",
        interest: "Study Support",
        members: 12,
        max_members: 15,
        online: 5,
        allows_anonymous: true,
        description: "Support each other through exam stress with study tips and motivation",
    },
    SeedCircle {
        id: "3",
        name: "Creative Corner",
        interest: "Art",
        members: 6,
        max_members: 10,
        online: 2,
        allows_anonymous: false,
        description: "Share your artwork, get feedback, and inspire each other",
    },
    SeedCircle {
        id: "4",
        name: "Fitness Crew",
        interest: "Sports",
        members: 10,
        max_members: 12,
        online: 4,
        allows_anonymous: false,
        description: "Stay motivated, share workout routines, track progress together",
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackStore;

impl FallbackStore {
    pub fn new() -> Self {
        Self
    }

    /// Non-empty, deterministic conversation for `circle_id`. Every entry is
    /// `Remote` and flagged `is_seed`.
    pub fn get_seed_messages(&self, circle_id: &CircleId) -> Vec<Message> {
        let conversation = CONVERSATIONS[conversation_index(circle_id, CONVERSATIONS.len())];
        let anchor = DateTime::<Utc>::from_timestamp(SEED_ANCHOR_SECS, 0).unwrap_or_default();

        conversation
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let sent_at = anchor + TimeDelta::minutes(index as i64);
                Message {
                    local_id: LocalId(index as u64 + 1),
                    server_id: Some(ServerMessageId::new(format!(
                        "seed:{circle_id}:{}",
                        index + 1
                    ))),
                    circle_id: circle_id.clone(),
                    author_id: UserId::from(line.author),
                    display_name: line.display_name.to_string(),
                    body: line.body.to_string(),
                    sent_at,
                    server_timestamp: Some(sent_at),
                    origin: MessageOrigin::Remote,
                    is_anonymous: line.is_anonymous,
                    is_seed: true,
                }
            })
            .collect()
    }

    pub fn seed_circles(&self, interest: Option<&str>) -> Vec<Circle> {
        SEED_CIRCLES
            .iter()
            .map(|seed| Circle {
                id: CircleId::from(seed.id),
                name: seed.name.to_string(),
                interest_tag: seed.interest.to_string(),
                member_count: seed.members,
                max_members: seed.max_members,
                online_count: seed.online,
                allows_anonymous: seed.allows_anonymous,
                description: Some(seed.description.to_string()),
            })
            .filter(|circle| circle.matches_interest(interest))
            .collect()
    }
}

// FNV-1a; stable across toolchains unlike the std hasher.
fn conversation_index(circle_id: &CircleId, len: usize) -> usize {
    let hash = circle_id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    (hash % len as u64) as usize
}
