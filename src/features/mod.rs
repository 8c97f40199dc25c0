/// 背景图获取（来源、预加载、解析）
pub mod background;
/// 健康检查
pub mod health;
/// 运行状态图渲染
pub mod status;
