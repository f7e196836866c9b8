//! 通知后端 trait 定义
//!
//! 后端是外部的"邮局"服务：查询某应用当前仍在显示的通知 tag，以及投递一条
//! 推送消息（JSON 字符串）。

use async_trait::async_trait;

use crate::click::AppId;
use crate::errors::PostalError;

const POSTAL_OBJECT_PATH_PART: &str = "/com/ubuntu/Postal/";

/// 通知后端
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &str;

    /// 查询仍在显示的通知 tag（同一 tag 可出现多次）
    async fn list_persistent(&self, app_id: &AppId) -> Result<Vec<String>, PostalError>;

    /// 投递一条推送消息
    async fn post(&self, app_id: &AppId, message: &str) -> Result<(), PostalError>;
}

/// 应用对应的邮局对象路径
///
/// 取 APP_ID 的包名部分，`+ . - : ~ _` 转义为 `_xx`（两位小写十六进制），例如
/// `com.ubuntu.music_music` → `/com/ubuntu/Postal/com_2eubuntu_2emusic`。
pub fn object_path(app_id: &AppId) -> Result<String, PostalError> {
    let parts: Vec<&str> = app_id.as_str().split('_').collect();
    if parts.len() < 2 || parts[0].is_empty() {
        return Err(PostalError::InvalidAppId(app_id.to_string()));
    }

    let mut path = String::from(POSTAL_OBJECT_PATH_PART);
    for c in parts[0].chars() {
        match c {
            '+' | '.' | '-' | ':' | '~' | '_' => path.push_str(&format!("_{:02x}", c as u32)),
            _ => path.push(c),
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_escapes_package() {
        let path = object_path(&AppId::new("com.ubuntu.music_music")).unwrap();
        assert_eq!(path, "/com/ubuntu/Postal/com_2eubuntu_2emusic");

        let path = object_path(&AppId::new("com.ubuntu.developer.webapps.webapp-gmail_webapp-gmail")).unwrap();
        assert_eq!(
            path,
            "/com/ubuntu/Postal/com_2eubuntu_2edeveloper_2ewebapps_2ewebapp_2dgmail"
        );
    }

    #[test]
    fn test_object_path_rejects_invalid() {
        assert!(matches!(
            object_path(&AppId::new("com.ubuntu.music")),
            Err(PostalError::InvalidAppId(_))
        ));
        assert!(object_path(&AppId::new("_app")).is_err());
    }
}
