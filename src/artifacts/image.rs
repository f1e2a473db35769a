// 图片工件处理器。不经过模型子调用：按描述构造生成服务 URL，
// 单次发送累计增量（即最终 URL）。
use super::HandlerContext;
use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

const IMAGE_ENDPOINT: &str = "https://image.pollinations.ai/prompt";
const DEFAULT_DIMENSION: &str = "1024";

fn param_regex(pattern: &str) -> Option<&'static Regex> {
    // 三个参数正则各自缓存一份，首次使用时编译。
    static WIDTH: OnceLock<Option<Regex>> = OnceLock::new();
    static HEIGHT: OnceLock<Option<Regex>> = OnceLock::new();
    static SEED: OnceLock<Option<Regex>> = OnceLock::new();
    let cell = match pattern {
        "width" => &WIDTH,
        "height" => &HEIGHT,
        _ => &SEED,
    };
    cell.get_or_init(|| Regex::new(&format!(r"{pattern}=(\d+)")).ok())
        .as_ref()
}

fn extract_param(prompt: &str, name: &str) -> Option<String> {
    param_regex(name)?
        .captures(prompt)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
}

fn build_image_url(prompt: &str) -> String {
    let width = extract_param(prompt, "width").unwrap_or_else(|| DEFAULT_DIMENSION.to_string());
    let height = extract_param(prompt, "height").unwrap_or_else(|| DEFAULT_DIMENSION.to_string());
    let seed = extract_param(prompt, "seed");

    let encoded = urlencode(prompt);
    let mut url = format!(
        "{IMAGE_ENDPOINT}/{encoded}?width={width}&height={height}&nologo=true&private=true&enhance=true"
    );
    if let Some(seed) = seed {
        url.push_str(&format!("&seed={seed}"));
    }
    url
}

fn urlencode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

pub(super) async fn on_create(ctx: &HandlerContext, title: &str) -> Result<String> {
    let url = build_image_url(title);
    ctx.emit_delta(url.clone())?;
    Ok(url)
}

pub(super) async fn on_update(
    ctx: &HandlerContext,
    _prior_content: &str,
    instruction: &str,
) -> Result<String> {
    let url = build_image_url(instruction);
    ctx.emit_delta(url.clone())?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_dimension_overrides() {
        let url = build_image_url("a red fox width=512 height=256 seed=7");
        assert!(url.contains("width=512"));
        assert!(url.contains("height=256"));
        assert!(url.contains("&seed=7"));
    }

    #[test]
    fn defaults_when_no_params() {
        let url = build_image_url("sunset over mountains");
        assert!(url.contains("width=1024"));
        assert!(url.contains("height=1024"));
        assert!(!url.contains("seed="));
    }

    #[test]
    fn prompt_is_percent_encoded() {
        let url = build_image_url("a b/c");
        assert!(url.contains("a%20b%2Fc"));
    }
}
