//! 文本启发式分类器
//!
//! 两个纯函数：区分「结构化载荷」（像代码/JSON/配置）与「叙述文本」（像散文），
//! 以及识别只是提到了指令动词的普通叙述句。本质是近似判断，用正反例表覆盖，
//! 不对内部逻辑做推断性测试。

/// 叙述句中常见的措辞；出现即认定为对话文本而非指令
const NARRATIVE_PHRASES: &[&str] = &[
    "has been",
    "have been",
    "i'll",
    "i will",
    "i've",
    "let me",
    "we need",
    "going to",
    "successfully",
];

/// 判断一行是否为对话叙述（用于抑制「提到动词的普通句子」造成的误报）
///
/// 指令行形如 `READ src/main.rs`，不会以句末标点结束，也不含叙述措辞。
pub fn is_conversational_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    if NARRATIVE_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    // 句末标点（含全角）意味着这是一句话，不是指令
    if trimmed.ends_with('.')
        || trimmed.ends_with('!')
        || trimmed.ends_with('?')
        || trimmed.ends_with('。')
        || trimmed.ends_with('！')
        || trimmed.ends_with('？')
    {
        // 但路径结尾的「.rs」之类不算句号
        let before_dot = trimmed.trim_end_matches(['.', '!', '?', '。', '！', '？']);
        if !looks_like_path_tail(before_dot) {
            return true;
        }
    }
    false
}

fn looks_like_path_tail(text: &str) -> bool {
    // `READ src/main.rs` 去掉句点后以扩展名结尾则不是叙述句
    text.rsplit(|c: char| c.is_whitespace())
        .next()
        .map(|last| last.contains('/') || last.contains('\\'))
        .unwrap_or(false)
}

/// 判断一行更像代码/JSON/配置而非散文
pub fn is_structured_line(line: &str) -> bool {
    let trimmed = line.trim_end();
    if trimmed.trim().is_empty() {
        return false;
    }
    // 缩进开头的行几乎总是代码
    if trimmed.starts_with("    ") || trimmed.starts_with('\t') {
        return true;
    }
    let t = trimmed.trim();
    // 符号密集的行
    if t.starts_with(['{', '}', '[', ']', '#', '<', '>'])
        || t.starts_with("//")
        || t.starts_with("--")
        || t.ends_with([';', '{', '}', ','])
    {
        return true;
    }
    // key = value / key: value（配置与 JSON 字段）
    if regex_kv().is_match(t) {
        return true;
    }
    // 常见代码关键字开头
    const CODE_STARTS: &[&str] = &[
        "fn ", "pub ", "let ", "use ", "impl ", "struct ", "enum ", "mod ", "def ", "class ",
        "import ", "from ", "return ", "if ", "for ", "while ", "const ", "static ", "match ",
    ];
    if CODE_STARTS.iter().any(|k| t.starts_with(k)) {
        return true;
    }
    false
}

fn regex_kv() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r#"^["']?[\w.\-]+["']?\s*[:=]\s*\S"#).expect("kv regex")
    })
}

/// 判断一段连续行是否为结构化载荷：非空行中结构化的占多数
pub fn is_structured_payload(lines: &[&str]) -> bool {
    let non_empty: Vec<&&str> = lines.iter().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.is_empty() {
        return false;
    }
    let structured = non_empty
        .iter()
        .filter(|l| is_structured_line(l))
        .count();
    structured * 2 >= non_empty.len()
}
