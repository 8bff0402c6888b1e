mod chat;
mod group;
mod post;
mod profile;

pub use chat::{
    ChatMessage, MessageStatus, ModerationAction, REPORT_THRESHOLD, Report, ReportOutcome,
    ReportReason,
};
pub use group::{
    AdmissionQuestion, Answer, EventDetails, Group, GroupKind, GroupSettings, GroupStats, Member,
    MemberStatus, MembershipRequest, RequestStatus, Resolution, ResolveOutcome, Role, SkillLevel,
    Visibility,
};
pub use post::{
    Comment, Post, PostView, Reaction, ReactionEntry, ReactionKind, ReactionMap, reaction_map,
};
pub use profile::UserProfile;
