use serde::{Deserialize, Serialize};

/// Style presets a generation request can be steered towards.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StyleHint {
    OceanKawaii,
    Bohemian,
    BohemianNatural,
    OceanShell,
    CandyPlayful,
    DreamyStar,
    Minimalist,
    VintageElegant,
}

impl StyleHint {
    pub const ALL: [StyleHint; 8] = [
        StyleHint::OceanKawaii,
        StyleHint::Bohemian,
        StyleHint::BohemianNatural,
        StyleHint::OceanShell,
        StyleHint::CandyPlayful,
        StyleHint::DreamyStar,
        StyleHint::Minimalist,
        StyleHint::VintageElegant,
    ];

    /// Text prepended to the instruction sent to the image model.
    pub fn injection(self) -> &'static str {
        match self {
            StyleHint::OceanKawaii => {
                "Style: ocean kawaii bag charm, pastel pink and aqua, seashells, pearls, glossy resin accents"
            }
            StyleHint::Bohemian => "Style: bohemian charm, woven cord, tassels, wooden and agate beads, warm earth tones",
            StyleHint::BohemianNatural => {
                "Style: natural bohemian keychain, raw stone, linen cord, dried-flower resin, muted greens"
            }
            StyleHint::OceanShell => "Style: seashell pendant, natural shell texture, starfish, sea-glass beads",
            StyleHint::CandyPlayful => "Style: playful candy charm, bright acrylic shapes, colorful beads, glossy finish",
            StyleHint::DreamyStar => "Style: dreamy star charm, iridescent crystals, moon and star pendants, lavender tones",
            StyleHint::Minimalist => "Style: minimalist modern charm, clean lines, single focal pendant, brushed metal",
            StyleHint::VintageElegant => {
                "Style: vintage elegant charm, antique gold hardware, pearls, enamel details"
            }
        }
    }

    // Chinese keywords users typically type for each style
    fn keywords(self) -> &'static [&'static str] {
        match self {
            StyleHint::OceanKawaii => &["海洋", "少女", "kawaii"],
            StyleHint::Bohemian => &["波西米亚", "boho"],
            StyleHint::BohemianNatural => &["自然", "原石"],
            StyleHint::OceanShell => &["贝壳", "海星"],
            StyleHint::CandyPlayful => &["糖果", "可爱", "candy"],
            StyleHint::DreamyStar => &["星星", "梦幻", "星空"],
            StyleHint::Minimalist => &["极简", "简约", "minimal"],
            StyleHint::VintageElegant => &["复古", "优雅", "vintage"],
        }
    }
}

/// First style whose keywords appear in `text`.
pub fn detect_style(text: &str) -> Option<StyleHint> {
    let lower = text.to_lowercase();
    StyleHint::ALL
        .into_iter()
        .find(|hint| hint.keywords().iter().any(|k| lower.contains(k)))
}

/// Prompt for the image model: style injection first, then the instruction.
pub fn compose_prompt(instruction: &str, style: Option<StyleHint>) -> String {
    match style {
        Some(hint) => format!("{}\n\n{}", hint.injection(), instruction),
        None => instruction.to_string(),
    }
}

/// System prompt for the design assistant, optionally biased towards a style.
pub fn design_system_prompt(style: Option<StyleHint>) -> String {
    let mut prompt = String::from(
        "你是专业的配饰设计师，专注于挂饰、钥匙扣、包挂等品类。\n\n\
         常见材料：贝壳、天然石、水晶、亚克力、树脂、珍珠、玛瑙；\
         辅助元素：玻璃珠、管珠、隔珠、流苏、编织绳；\
         五金配件：龙虾扣、钥匙环、登山扣、旋转扣、延长链、跳环。\n\n\
         分析图片时准确识别元素品类、材质、颜色和数量；\
         生成 prompt 时使用英文和配饰行业术语，确保结果符合配饰形态。\
         请用专业但友好的语气回复。",
    );
    if let Some(hint) = style {
        prompt.push_str("\n\n当前风格偏好：");
        prompt.push_str(hint.injection());
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn style_hints_deserialize_from_snake_case() {
        let hint: StyleHint = serde_json::from_str("\"ocean_kawaii\"").unwrap();
        assert_eq!(hint, StyleHint::OceanKawaii);
    }

    #[test]
    fn compose_prompt_prepends_injection() {
        assert_eq!(compose_prompt("加一个蝴蝶结", None), "加一个蝴蝶结");
        let prompt = compose_prompt("加一个蝴蝶结", Some(StyleHint::Minimalist));
        assert!(prompt.starts_with("Style: minimalist"));
        assert!(prompt.ends_with("\n\n加一个蝴蝶结"));
    }

    #[test]
    fn detect_style_matches_keywords() {
        assert_eq!(detect_style("想要复古一点"), Some(StyleHint::VintageElegant));
        assert_eq!(detect_style("Make it MINIMAL"), Some(StyleHint::Minimalist));
        assert_eq!(detect_style("加一个蝴蝶结"), None);
    }

    #[test]
    fn system_prompt_mentions_style_when_given() {
        assert!(!design_system_prompt(None).contains("当前风格偏好"));
        assert!(design_system_prompt(Some(StyleHint::DreamyStar)).contains("dreamy star"));
    }
}
