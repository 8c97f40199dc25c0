use once_cell::sync::OnceCell;
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// 背景图站点普遍会拦截非浏览器 UA，这里统一伪装成桌面 Chrome。
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";

/// 全局复用的 HTTP Client（统一连接池/Keep-Alive），避免每次请求重复创建。
///
/// 说明：
/// - 不同来源的 timeout/proxy 可以不同，这里按 (timeout, proxy) 维度拆分 client。
/// - `Client` 本身是线程安全的，clone 只是增加引用计数。
static CLIENTS_BY_PROFILE: OnceCell<Mutex<HashMap<(u64, Option<String>), Client>>> =
    OnceCell::new();

/// 按超时与代理获取（或创建）共享的 HTTP Client，自动跟随重定向。
pub fn client_for(timeout_secs: u64, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let key = (timeout_secs, proxy.map(str::to_string));
    let clients = CLIENTS_BY_PROFILE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = clients.lock()
        && let Some(c) = guard.get(&key)
    {
        return Ok(c.clone());
    }

    let mut builder = Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(BROWSER_USER_AGENT);
    if let Some(p) = proxy {
        builder = builder.proxy(Proxy::all(p)?);
    }
    let client = builder.build()?;

    if let Ok(mut guard) = clients.lock() {
        guard.insert(key, client.clone());
    }
    Ok(client)
}
