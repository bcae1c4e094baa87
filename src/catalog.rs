use serde::{Deserialize, Serialize};

/// 木鱼书目录条目
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    pub category: String,
    pub description: String,
    pub image: String,
}

/// The fixed muyu shu catalog served by the informational pages.
pub fn catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            id: "1".to_string(),
            title: "花笺记".to_string(),
            category: "爱情故事".to_string(),
            description: "经典木鱼书爱情故事".to_string(),
            image: "https://example.com/image1.jpg".to_string(),
        },
        CatalogEntry {
            id: "2".to_string(),
            title: "二荷花史".to_string(),
            category: "历史传说".to_string(),
            description: "历史题材木鱼书".to_string(),
            image: "https://example.com/image2.jpg".to_string(),
        },
    ]
}

/// Look up one catalog entry by id.
pub fn find_by_id(id: &str) -> Option<CatalogEntry> {
    catalog().into_iter().find(|entry| entry.id == id)
}

/// 小木鱼助手开场白
pub fn welcome_message() -> String {
    "您好！我是小木鱼助手，专注于木鱼书研究。木鱼书是流行于广东地区的传统说唱艺术，\
     也是宝贵的非物质文化遗产。\n\n我可以为您解答以下方面的基础知识：\n\n\
     1. 木鱼书的起源与发展历史\n2. 木鱼书的表演形式与艺术特点\n\
     3. 木鱼书的代表作品与流派\n4. 木鱼书的音乐特征与唱腔\n\
     5. 木鱼书作为非遗的传承保护现状\n\n\
     请问您对哪个方面特别感兴趣？"
        .to_string()
}
