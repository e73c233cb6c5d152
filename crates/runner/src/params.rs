//! 运行参数解析
//!
//! 参数作用域：项目参数打底，任务参数覆盖同名键。每次运行只解析一次，
//! 时间模式以运行的实际开始时间展开，机密值在此时解密，解密结果不落库。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use taskhub_config::SecretCipher;
use taskhub_domain::entities::Param;
use taskhub_errors::HubResult;

/// 合并项目与任务参数并展开
pub fn resolve(
    project_params: &[Param],
    task_params: &[Param],
    started_at: DateTime<Utc>,
    cipher: Option<&SecretCipher>,
) -> HubResult<HashMap<String, String>> {
    let mut resolved = HashMap::new();
    for param in project_params.iter().chain(task_params.iter()) {
        let value = if param.secret {
            match cipher {
                Some(cipher) => cipher.decrypt(&param.value)?,
                None => {
                    // 未配置密钥时保留密文，步骤得到的就是存储值
                    warn!("参数 '{}' 为机密但未配置解密密钥", param.key);
                    param.value.clone()
                }
            }
        } else {
            param.value.clone()
        };
        resolved.insert(param.key.clone(), expand_time_patterns(&value, started_at));
    }
    Ok(resolved)
}

/// 展开 parse("...") 时间模式，格式串为chrono strftime语法
///
/// 例: parse("%Y-%m-%d") 在 2026-01-10 的运行中展开为 "2026-01-10"
pub fn expand_time_patterns(value: &str, at: DateTime<Utc>) -> String {
    const OPEN: &str = "parse(\"";
    const CLOSE: &str = "\")";

    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(end) => {
                let pattern = &after_open[..end];
                result.push_str(&at.format(pattern).to_string());
                rest = &after_open[end + CLOSE.len()..];
            }
            None => {
                // 未闭合，按字面量保留
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// 将参数代入配置字符串中的 {{key}} 占位符
pub fn apply_placeholders(template: &str, params: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in params {
        result = result.replace(&format!("{{{{{key}}}}}"), value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 2, 30, 0).unwrap()
    }

    #[test]
    fn test_task_params_override_project_params() {
        let project = vec![Param::new("env", "prod"), Param::new("region", "eu")];
        let task = vec![Param::new("env", "staging")];
        let resolved = resolve(&project, &task, at(), None).unwrap();
        assert_eq!(resolved["env"], "staging");
        assert_eq!(resolved["region"], "eu");
    }

    #[test]
    fn test_time_pattern_expansion() {
        assert_eq!(
            expand_time_patterns("extract_parse(\"%Y%m%d\").csv", at()),
            "extract_20260110.csv"
        );
        assert_eq!(
            expand_time_patterns("parse(\"%Y-%m-%d %H:%M\")", at()),
            "2026-01-10 02:30"
        );
        // 无模式的值原样返回
        assert_eq!(expand_time_patterns("plain", at()), "plain");
    }

    #[test]
    fn test_unclosed_pattern_kept_verbatim() {
        assert_eq!(
            expand_time_patterns("broken parse(\"%Y", at()),
            "broken parse(\"%Y"
        );
    }

    #[test]
    fn test_secret_decryption() {
        use base64::{engine::general_purpose, Engine as _};
        let key = general_purpose::STANDARD.encode([3u8; 32]);
        let cipher = SecretCipher::from_base64_key(&key).unwrap();
        let encrypted = cipher.encrypt("hunter2").unwrap();

        let task = vec![Param {
            key: "db_password".to_string(),
            value: encrypted,
            secret: true,
        }];
        let resolved = resolve(&[], &task, at(), Some(&cipher)).unwrap();
        assert_eq!(resolved["db_password"], "hunter2");
    }

    #[test]
    fn test_placeholders() {
        let mut params = HashMap::new();
        params.insert("table".to_string(), "orders".to_string());
        assert_eq!(
            apply_placeholders("SELECT * FROM {{table}}", &params),
            "SELECT * FROM orders"
        );
    }
}
