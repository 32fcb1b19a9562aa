//! Built-in prompt catalog.

use super::{PromptLane, PromptTemplate};

const PRIMARY: &[(&str, &str, &str)] = &[
    ("portrait_front", "portrait", "close-up portrait of {subject}, looking at camera, neutral expression, soft studio lighting"),
    ("portrait_smile", "portrait", "close-up portrait of {subject}, smiling warmly, soft natural light"),
    ("portrait_three_quarter", "portrait", "three-quarter view portrait of {subject}, looking slightly away, studio lighting"),
    ("portrait_profile_left", "portrait", "side profile portrait of {subject} facing left, rim lighting"),
    ("portrait_profile_right", "portrait", "side profile portrait of {subject} facing right, window light"),
    ("portrait_laughing", "portrait", "candid photo of {subject} laughing, shallow depth of field"),
    ("portrait_serious", "portrait", "headshot of {subject} with a serious expression, dramatic lighting"),
    ("portrait_looking_up", "portrait", "close-up of {subject} looking up, soft overhead light"),
    ("portrait_looking_down", "portrait", "close-up of {subject} looking down thoughtfully, indoors"),
    ("portrait_golden_hour", "portrait", "portrait of {subject} outdoors at golden hour, warm sunlight"),
    ("portrait_overcast", "portrait", "portrait of {subject} outdoors on an overcast day, diffuse light"),
    ("portrait_night_city", "portrait", "portrait of {subject} at night in a city street, neon lighting"),
    ("upper_body_cafe", "upper_body", "upper body shot of {subject} sitting in a cafe, indoors, natural light"),
    ("upper_body_office", "upper_body", "upper body shot of {subject} at an office desk, wearing a blazer"),
    ("upper_body_park", "upper_body", "upper body shot of {subject} in a park, outdoors, sunlight through trees"),
    ("upper_body_kitchen", "upper_body", "upper body shot of {subject} cooking in a kitchen, indoors"),
    ("upper_body_reading", "upper_body", "upper body shot of {subject} reading a book, sitting by a window"),
    ("upper_body_hoodie", "upper_body", "upper body shot of {subject} wearing a hoodie, casual, indoors"),
    ("upper_body_formal", "upper_body", "upper body shot of {subject} in formal attire, studio lighting"),
    ("upper_body_beach", "upper_body", "upper body shot of {subject} at the beach, outdoors, bright sunlight"),
];

const SECONDARY: &[(&str, &str, &str)] = &[
    ("full_body_standing_street", "full_body", "full body shot of {subject} standing on a city street, daytime"),
    ("full_body_walking_park", "full_body", "full body shot of {subject} walking in a park, outdoors"),
    ("full_body_sitting_bench", "full_body", "full body shot of {subject} sitting on a bench, outdoors"),
    ("full_body_studio", "full_body", "full body shot of {subject} standing, plain studio background"),
    ("full_body_living_room", "full_body", "full body shot of {subject} sitting on a sofa in a living room, indoors"),
    ("full_body_night", "full_body", "full body shot of {subject} standing at night under street lights"),
    ("scene_market", "scene", "{subject} browsing a busy outdoor market, candid, natural light"),
    ("scene_library", "scene", "{subject} in a library between tall shelves, indoors, warm light"),
    ("scene_hiking", "scene", "{subject} hiking on a mountain trail, outdoors, sunlight"),
    ("scene_rain", "scene", "{subject} holding an umbrella in the rain, city street, overcast"),
];

/// Catalog compiled into the binary: reference-conditioned portraits on the
/// primary lane, wider framings on the secondary lane.
pub fn builtin_prompts() -> Vec<PromptTemplate> {
    PRIMARY
        .iter()
        .map(|(id, category, text)| PromptTemplate::new(*id, PromptLane::Primary, *category, *text))
        .chain(SECONDARY.iter().map(|(id, category, text)| {
            PromptTemplate::new(*id, PromptLane::Secondary, *category, *text)
        }))
        .collect()
}
