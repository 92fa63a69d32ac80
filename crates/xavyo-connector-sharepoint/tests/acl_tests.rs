//! ACL tests: documents served by the connector are combined through their
//! inheritance chains and evaluated per principal.

mod common;

use common::*;
use std::collections::HashMap;
use std::sync::Arc;

use xavyo_connector_sharepoint::acl::{READ_SECURITY_FRAGMENT, SITE_COLLECTION_ADMIN_FRAGMENT};
use xavyo_connector_sharepoint::model::{
    ItemData, ItemRow, List, PermissionScope, PolicyUser, PrincipalInfo, PrincipalType,
};
use xavyo_connector_sharepoint::permissions::{LIST_ITEM_MASK, READ_SECURITY_LIST_ITEM_MASK};
use xavyo_connector_sharepoint::{
    authorize, collect_chain, Acl, AclKey, AuthzDecision, DocId, DocRequest, MemoryCursorStore,
    Principal, SharePointConfig,
};

const ITEM: &str = "http://sp.example.com/sites/hr/Lists/Tasks/1_.000";
const LIST_VIEW: &str = "http://sp.example.com/sites/hr/Lists/Tasks/AllItems.aspx";
const LIST_ROOT: &str = "http://sp.example.com/sites/hr/Lists/Tasks";

fn tasks_list(read_security: i32) -> List {
    List {
        id: "{TASKS}".to_string(),
        title: "Tasks".to_string(),
        scope_id: "{HR-SCOPE}".to_string(),
        root_folder: "/sites/hr/Lists/Tasks".to_string(),
        default_view_url: "/sites/hr/Lists/Tasks/AllItems.aspx".to_string(),
        default_view_item_url: "/sites/hr/Lists/Tasks/DispForm.aspx".to_string(),
        read_security,
        last_modified: "2024-05-14 08:30:00Z".to_string(),
        ..List::default()
    }
}

fn task_item(scope_id: &str) -> ItemData {
    ItemData {
        row: ItemRow::from_pairs([
            ("ows_ServerUrl", "/sites/hr/Lists/Tasks/1_.000"),
            ("ows_FileRef", "1;#sites/hr/Lists/Tasks/1_.000"),
            ("ows_FSObjType", "1;#0"),
            ("ows_ContentTypeId", "0x0100ABCDEF"),
            ("ows_Author", "7;#Alice"),
            ("ows_ScopeId", scope_id),
            ("ows_Modified", "2024-05-14T08:30:00Z"),
            ("ows_Title", "Quarterly review"),
        ]),
        scopes: vec![PermissionScope {
            id: "{ITEM-SCOPE}".to_string(),
            permissions: vec![
                grant(21, LIST_ITEM_MASK),
                grant(7, LIST_ITEM_MASK),
                grant(31, READ_SECURITY_LIST_ITEM_MASK),
                grant(41, READ_SECURITY_LIST_ITEM_MASK),
            ],
        }],
        metadata_scope_permissions: Vec::new(),
    }
}

/// HR site with a Tasks list and one item; CORP\blocked is denied by policy.
fn acl_deployment(read_security: i32, item_scope: &str) -> Arc<Deployment> {
    let deployment = standard_deployment();
    deployment.update(|s| {
        if let Some(vs) = s.virtual_server.as_mut() {
            vs.policy = vec![PolicyUser {
                login_name: "i:0#.w|CORP\\blocked".to_string(),
                grant_mask: 0,
                deny_mask: LIST_ITEM_MASK,
            }];
        }
        s.principals.insert(
            "i:0#.w|CORP\\blocked".to_string(),
            PrincipalInfo {
                account_name: "i:0#.w|CORP\\blocked".to_string(),
                display_name: "blocked".to_string(),
                principal_type: PrincipalType::User,
                is_resolved: true,
            },
        );
        if let Some(web) = s.webs.get_mut(HR_SITE) {
            web.users = vec![
                site_admin(1, "CORP\\admin"),
                user(7, "CORP\\alice"),
                user(11, "CORP\\member"),
                user(21, "CORP\\reader"),
                user(31, "CORP\\manager"),
                user(41, "CORP\\blocked"),
            ];
            web.permissions = vec![grant(11, LIST_ITEM_MASK)];
        }
    });
    deployment.add_list(HR_SITE, tasks_list(read_security));
    deployment.add_item("{TASKS}", "1", task_item(item_scope));
    deployment.add_segments(ITEM, Some("{TASKS}"), Some("1"));
    deployment.add_segments(LIST_VIEW, Some("{TASKS}"), None);
    deployment
}

async fn harness(deployment: Arc<Deployment>) -> Harness {
    connect(
        SharePointConfig::new(SERVER),
        deployment,
        Arc::new(MemoryCursorStore::new()),
    )
    .await
    .unwrap()
}

/// Fetches `doc_ids` and files their ACLs and fragments by key.
async fn acl_store(h: &Harness, doc_ids: &[DocId]) -> HashMap<AclKey, Acl> {
    let mut store = HashMap::new();
    for doc_id in doc_ids {
        let response = h
            .connector
            .get_doc_content(&DocRequest::new(doc_id.clone()))
            .await
            .unwrap();
        if let Some(acl) = response.acl {
            store.insert(AclKey::document(doc_id.clone()), acl);
        }
        for (fragment, acl) in response.named_resources {
            store.insert(AclKey::fragment(doc_id.clone(), fragment), acl);
        }
    }
    store
}

fn corp(name: &str) -> Principal {
    Principal::user(format!("CORP\\{name}"), "Default")
}

#[tokio::test]
async fn test_read_security_requires_both_item_and_strict_permits() {
    let h = harness(acl_deployment(2, "3;#{ITEM-SCOPE}")).await;
    let store = acl_store(&h, &[DocId::root(), DocId::new(HR_SITE), DocId::new(ITEM)]).await;

    assert!(store.contains_key(&AclKey::fragment(DocId::new(HR_SITE), SITE_COLLECTION_ADMIN_FRAGMENT)));
    assert!(store.contains_key(&AclKey::fragment(DocId::new(ITEM), READ_SECURITY_FRAGMENT)));

    let chain = collect_chain(&store, &AclKey::document(DocId::new(ITEM)), 16).unwrap();
    assert_eq!(chain.len(), 4);
    assert!(chain[0].inherit_from().is_none());

    // Readers without list management only see their own items.
    assert_eq!(authorize(&corp("reader"), &chain), AuthzDecision::Deny);
    // The author always qualifies for the strict fragment.
    assert_eq!(authorize(&corp("alice"), &chain), AuthzDecision::Permit);
    assert_eq!(authorize(&corp("manager"), &chain), AuthzDecision::Permit);
    // Site collection administrators see every item.
    assert_eq!(authorize(&corp("admin"), &chain), AuthzDecision::Permit);
    // Web application policy denials win over everything below.
    assert_eq!(authorize(&corp("blocked"), &chain), AuthzDecision::Deny);
    assert_eq!(authorize(&corp("stranger"), &chain), AuthzDecision::Deny);
}

#[tokio::test]
async fn test_read_security_ignored_when_not_honored() {
    let deployment = acl_deployment(2, "3;#{ITEM-SCOPE}");
    let h = connect(
        SharePointConfig::new(SERVER).with_read_security(false),
        deployment,
        Arc::new(MemoryCursorStore::new()),
    )
    .await
    .unwrap();
    let store = acl_store(&h, &[DocId::root(), DocId::new(HR_SITE), DocId::new(ITEM)]).await;

    assert!(!store.contains_key(&AclKey::fragment(DocId::new(ITEM), READ_SECURITY_FRAGMENT)));
    let chain = collect_chain(&store, &AclKey::document(DocId::new(ITEM)), 16).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(authorize(&corp("reader"), &chain), AuthzDecision::Permit);
}

#[tokio::test]
async fn test_item_in_list_scope_inherits_from_root_folder() {
    let h = harness(acl_deployment(1, "1;#{HR-SCOPE}")).await;

    let item = h
        .connector
        .get_doc_content(&DocRequest::new(ITEM))
        .await
        .unwrap();
    let acl = item.acl.expect("item acl");
    assert_eq!(acl.inherit_from().map(|i| i.doc_id.clone()), Some(DocId::new(LIST_ROOT)));
    assert!(acl.permits().is_empty());
    assert!(item.named_resources.is_empty());

    let list = h
        .connector
        .get_doc_content(&DocRequest::new(LIST_VIEW))
        .await
        .unwrap();
    let list_acl = list.acl.expect("list acl");
    assert_eq!(list_acl.inherit_from().map(|i| i.doc_id.clone()), Some(DocId::new(LIST_ROOT)));

    // The root folder ACL is pushed off the request path.
    h.connector.pool().wait_idle().await;
    let log = h.pusher.snapshot();
    let (_, root_folder) = log
        .named_resources
        .iter()
        .find(|(doc_id, _)| doc_id.as_str() == LIST_ROOT)
        .expect("root folder named resource");
    assert_eq!(root_folder.inherit_from().map(|i| i.doc_id.clone()), Some(DocId::new(HR_SITE)));
}

#[tokio::test]
async fn test_anonymous_web_has_no_acl_unless_policy_denies() {
    let deployment = standard_deployment();
    deployment.update(|s| {
        if let Some(web) = s.webs.get_mut(FINANCE_SITE) {
            web.allow_anonymous_access = true;
            web.anonymous_view_list_items = true;
            web.anonymous_permission_mask = LIST_ITEM_MASK;
        }
    });
    let h = harness(deployment.clone()).await;
    let response = h
        .connector
        .get_doc_content(&DocRequest::new(FINANCE_SITE))
        .await
        .unwrap();
    assert!(!response.is_not_found());
    assert!(response.acl.is_none());

    let denied = acl_deployment(1, "1;#{HR-SCOPE}");
    denied.update(|s| {
        if let Some(web) = s.webs.get_mut(FINANCE_SITE) {
            web.allow_anonymous_access = true;
            web.anonymous_view_list_items = true;
            web.anonymous_permission_mask = LIST_ITEM_MASK;
        }
    });
    let h = harness(denied).await;
    let response = h
        .connector
        .get_doc_content(&DocRequest::new(FINANCE_SITE))
        .await
        .unwrap();
    assert!(response.acl.is_some());
}

#[tokio::test]
async fn test_site_collection_admin_fragment_stops_at_site_in_single_site_mode() {
    let h = connect(
        SharePointConfig::new(HR_SITE),
        acl_deployment(1, "1;#{HR-SCOPE}"),
        Arc::new(MemoryCursorStore::new()),
    )
    .await
    .unwrap();
    let store = acl_store(&h, &[DocId::new(HR_SITE)]).await;

    let chain = collect_chain(&store, &AclKey::document(DocId::new(HR_SITE)), 16).unwrap();
    assert_eq!(chain.len(), 2);
    assert!(chain[0].inherit_from().is_none());
    assert_eq!(authorize(&corp("admin"), &chain), AuthzDecision::Permit);
    assert_eq!(authorize(&corp("member"), &chain), AuthzDecision::Permit);
    assert_eq!(authorize(&corp("reader"), &chain), AuthzDecision::Deny);
}
