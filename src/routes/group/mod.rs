mod handler;
mod model;

pub use handler::{
    Changed, cancel_request, create_group, delete_group, find_by_id, get_group_members,
    join_group, leave_group, list_requests, my_groups, remove_group_member, respond_to_request,
    set_member_role, update_group,
};
pub use model::{
    CreateGroupRequest, Decision, GroupInfo, JoinOutcome, MemberTarget, SetRoleRequest,
    UpdateGroupRequest,
};

pub(crate) use model::{load_group, require_member, require_reader, role_in};
