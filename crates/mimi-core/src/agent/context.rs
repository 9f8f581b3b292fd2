//! Fixed prompts and replies, and assembly of the message list sent to the
//! completion service.

use crate::provider::classify::BUSY_REPLY;
use crate::store::HistoryEntry;
use crate::types::{Message, MessageContent};

/// Persona and output contract for text conversations.
pub const PERSONA_PROMPT: &str = r#"你是「AI 小咪」，一位溫柔、療癒、正向的健康教練。
你擅長陪伴使用者調整飲食、體重管理、健康習慣與情緒。

回覆時請：
- 先理解使用者的處境與心情
- 用繁體中文給出貼心、具體、做得到的建議
- 語氣自然溫暖，像一位有行動力的朋友，不要制式

另外，請替使用者「這一句話」分類，category 只能是下列其中之一：
- "diet"：飲食、減重、熱量、吃什麼喝什麼
- "emotion"：心情、壓力、焦慮、低落、需要鼓勵
- "health"：運動、睡眠、身體不適、生活習慣
- "general"：不屬於以上三類的內容

只回傳一個 JSON 物件，不要有任何其他文字：
{
  "category": "diet | emotion | health | general 其中一個",
  "reply": "要對使用者說的完整回覆（繁體中文）"
}"#;

/// Greeting shown before the EULA link to a user who has not agreed yet.
pub const CONSENT_INTRO: &str = "嗨～歡迎使用 AI 小咪！第一次見面，小咪要先請你閱讀並同意「使用者條款」。你的個人資料小咪會好好保護，請放心喔！";

/// Safe reply after an internal failure.
pub const FALLBACK_REPLY: &str = BUSY_REPLY;

/// The photo could not be downloaded.
pub const IMAGE_RETRY_REPLY: &str = "小咪剛剛沒有收到照片，可以再傳一次給我嗎？";

/// The photo could not be analyzed.
pub const IMAGE_RESEND_REPLY: &str = "小咪看不太清楚這張照片，可以再拍一張清楚一點的餐點照片給我嗎？";

/// Analysis succeeded but carried no advice.
pub const MEAL_ADVICE_FALLBACK: &str = "小咪幫你把這餐記錄下來了！記得多吃蔬菜、喝足水分喔～";

/// Message types other than text and image.
pub const UNSUPPORTED_REPLY: &str = "小咪目前只看得懂文字和照片，其他類型的訊息還在學習中喔！";

/// Consent request with the document link.
pub fn consent_request_text(url: &str) -> String {
    format!("{}\n\n{}", CONSENT_INTRO, url)
}

/// System prompt, then prior turns, then the new utterance.
pub fn build_messages(history: &[HistoryEntry], prompt: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(PERSONA_PROMPT));
    for entry in history {
        messages.push(Message {
            role: entry.direction.role(),
            content: MessageContent::Text(entry.text.clone()),
        });
    }
    messages.push(Message::user(prompt));
    messages
}
