//! SharePoint base permission bits and the masks the ACL engine checks them against.

pub const VIEW_LIST_ITEMS: u64 = 0x1;
pub const ADD_LIST_ITEMS: u64 = 0x2;
pub const EDIT_LIST_ITEMS: u64 = 0x4;
pub const DELETE_LIST_ITEMS: u64 = 0x8;
pub const APPROVE_ITEMS: u64 = 0x10;
pub const OPEN_ITEMS: u64 = 0x20;
pub const VIEW_VERSIONS: u64 = 0x40;
pub const DELETE_VERSIONS: u64 = 0x80;
pub const CANCEL_CHECKOUT: u64 = 0x100;
pub const MANAGE_PERSONAL_VIEWS: u64 = 0x200;
pub const MANAGE_LISTS: u64 = 0x800;
pub const VIEW_FORM_PAGES: u64 = 0x1000;
pub const OPEN: u64 = 0x10000;
pub const VIEW_PAGES: u64 = 0x20000;
pub const ADD_AND_CUSTOMIZE_PAGES: u64 = 0x40000;
pub const APPLY_THEME_AND_BORDER: u64 = 0x80000;
pub const APPLY_STYLE_SHEETS: u64 = 0x100000;
pub const VIEW_USAGE_DATA: u64 = 0x200000;
pub const CREATE_SSC_SITE: u64 = 0x400000;
pub const MANAGE_SUBWEBS: u64 = 0x800000;
pub const CREATE_GROUPS: u64 = 0x1000000;
pub const MANAGE_PERMISSIONS: u64 = 0x2000000;
pub const BROWSE_DIRECTORIES: u64 = 0x4000000;
pub const BROWSE_USER_INFO: u64 = 0x8000000;
pub const ADD_DEL_PRIVATE_WEB_PARTS: u64 = 0x10000000;
pub const UPDATE_PERSONAL_WEB_PARTS: u64 = 0x20000000;
pub const MANAGE_WEB: u64 = 0x40000000;
pub const USE_CLIENT_INTEGRATION: u64 = 0x1000000000;
pub const USE_REMOTE_APIS: u64 = 0x2000000000;
pub const MANAGE_ALERTS: u64 = 0x4000000000;
pub const CREATE_ALERTS: u64 = 0x8000000000;
pub const EDIT_MY_USER_INFO: u64 = 0x10000000000;
pub const ENUMERATE_PERMISSIONS: u64 = 0x4000000000000000;
pub const FULL_MASK: u64 = 0x7FFFFFFFFFFFFFFF;

/// Bits a principal needs to read a list item.
pub const LIST_ITEM_MASK: u64 = OPEN | VIEW_PAGES | VIEW_LIST_ITEMS;

/// Bits a principal needs to read other users' items in a read-security list.
pub const READ_SECURITY_LIST_ITEM_MASK: u64 = LIST_ITEM_MASK | MANAGE_LISTS;

/// The "Full Read" web application policy level.
pub const FULL_READ_PERMISSION_MASK: u64 = OPEN
    | VIEW_LIST_ITEMS
    | OPEN_ITEMS
    | VIEW_VERSIONS
    | VIEW_PAGES
    | VIEW_USAGE_DATA
    | BROWSE_DIRECTORIES
    | VIEW_FORM_PAGES
    | ENUMERATE_PERMISSIONS
    | BROWSE_USER_INFO
    | USE_REMOTE_APIS
    | USE_CLIENT_INTEGRATION;

/// List read-security value meaning "users read only their own items".
pub const LIST_READ_SECURITY_ENABLED: i32 = 2;

/// Returns true when every bit of `required` is present in `mask`.
#[must_use]
pub fn is_permitted(mask: u64, required: u64) -> bool {
    mask & required == required
}
