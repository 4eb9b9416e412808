//! Scoped role-based access control.
//!
//! Every relationship is one [`PolicyRule`]: a grant of `(resource, action)`
//! to a subject within a domain, or an edge making a member inherit
//! everything a parent holds within a domain. Subjects are namespaced
//! (`user:`, `role:`, `group:`) so users, roles and groups share one relation.
//!
//! A decision expands the subject through edges (breadth first, cycles
//! ignored) and allows iff any reached subject holds a matching grant in the
//! same domain. There is no implicit allow.
//!
//! The in-memory model is write-through: each mutation is persisted to the
//! [`PolicyStore`] before it is applied, and the lock is never held across
//! the store call.

mod cache;
pub mod interceptor;
mod roles;
mod rules;
mod templates;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use cache::DecisionCache;
use roles::{group_subject, role_description, role_subject, user_subject, GROUP_PREFIX, ROLE_PREFIX, USER_PREFIX};

pub use roles::{
    DomainKind, Permission, RoleDefinition, CANVAS_ADMIN, CANVAS_OWNER, CANVAS_VIEWER, ORG_ADMIN,
    ORG_OWNER, ORG_VIEWER,
};
pub use rules::{PolicyRule, PolicyStore};
pub use templates::PolicyTemplate;

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    /// Memoize decisions. Tests that mutate rules mid-flight may turn this off.
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    /// Replaces the built-in organization template when set.
    pub org_template: Option<PathBuf>,
    /// Replaces the built-in canvas template when set.
    pub canvas_template: Option<PathBuf>,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_capacity: 10_000,
            org_template: None,
            canvas_template: None,
        }
    }
}

#[derive(Debug, Default)]
struct Model {
    /// domain -> subject -> {(resource, action)}
    grants: HashMap<String, HashMap<String, BTreeSet<(String, String)>>>,
    /// domain -> member -> {parent}
    edges: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl Model {
    fn apply(&mut self, rule: &PolicyRule) {
        match rule {
            PolicyRule::Grant {
                subject,
                domain,
                resource,
                action,
            } => {
                self.grants
                    .entry(domain.clone())
                    .or_default()
                    .entry(subject.clone())
                    .or_default()
                    .insert((resource.clone(), action.clone()));
            }
            PolicyRule::Edge {
                member,
                parent,
                domain,
            } => {
                self.edges
                    .entry(domain.clone())
                    .or_default()
                    .entry(member.clone())
                    .or_default()
                    .insert(parent.clone());
            }
        }
    }

    fn retract(&mut self, rule: &PolicyRule) {
        match rule {
            PolicyRule::Grant {
                subject,
                domain,
                resource,
                action,
            } => {
                if let Some(subjects) = self.grants.get_mut(domain) {
                    if let Some(set) = subjects.get_mut(subject) {
                        set.remove(&(resource.clone(), action.clone()));
                        if set.is_empty() {
                            subjects.remove(subject);
                        }
                    }
                }
            }
            PolicyRule::Edge {
                member,
                parent,
                domain,
            } => {
                if let Some(members) = self.edges.get_mut(domain) {
                    if let Some(set) = members.get_mut(member) {
                        set.remove(parent);
                        if set.is_empty() {
                            members.remove(member);
                        }
                    }
                }
            }
        }
    }

    fn has_edge(&self, member: &str, parent: &str, domain: &str) -> bool {
        self.parents(member, domain).any(|p| p == parent)
    }

    fn parents<'a>(&'a self, member: &str, domain: &str) -> impl Iterator<Item = &'a String> + 'a {
        self.edges
            .get(domain)
            .and_then(|members| members.get(member))
            .into_iter()
            .flatten()
    }

    fn members(&self, parent: &str, domain: &str) -> Vec<String> {
        self.edges
            .get(domain)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, parents)| parents.contains(parent))
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The subject followed by every ancestor, nearest first.
    fn expand(&self, subject: &str, domain: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([subject.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            for parent in self.parents(&current, domain) {
                if !seen.contains(parent) {
                    queue.push_back(parent.clone());
                }
            }
            order.push(current);
        }
        order
    }

    fn allows(&self, subject: &str, domain: &str, resource: &str, action: &str) -> bool {
        let Some(grants) = self.grants.get(domain) else {
            return false;
        };
        let wanted = (resource.to_string(), action.to_string());
        self.expand(subject, domain)
            .iter()
            .any(|s| grants.get(s).is_some_and(|set| set.contains(&wanted)))
    }

    fn permissions(&self, subject: &str, domain: &str) -> BTreeSet<(String, String)> {
        let Some(grants) = self.grants.get(domain) else {
            return BTreeSet::new();
        };
        self.expand(subject, domain)
            .iter()
            .filter_map(|s| grants.get(s))
            .flatten()
            .cloned()
            .collect()
    }

    fn knows_role(&self, role: &str, domain: &str) -> bool {
        let subject = role_subject(role);
        self.grants
            .get(domain)
            .is_some_and(|g| g.contains_key(&subject))
            || self.parents(&subject, domain).next().is_some()
            || !self.members(&subject, domain).is_empty()
    }

    /// Ids of domains of `kind` where the subject has any edge.
    fn domains_of(&self, subject: &str, kind: DomainKind) -> Vec<String> {
        let prefix = format!("{}:", kind.as_str());
        let mut ids: Vec<String> = self
            .edges
            .iter()
            .filter(|(domain, members)| domain.starts_with(&prefix) && members.contains_key(subject))
            .map(|(domain, _)| domain[prefix.len()..].to_string())
            .collect();
        ids.sort();
        ids
    }
}

/// The process-wide RBAC engine. Construct once and share behind an `Arc`.
pub struct Enforcer {
    store: Arc<dyn PolicyStore>,
    model: RwLock<Model>,
    cache: DecisionCache,
    org_template: PolicyTemplate,
    canvas_template: PolicyTemplate,
}

impl std::fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enforcer")
            .field("cache_enabled", &self.cache.is_enabled())
            .finish()
    }
}

impl Enforcer {
    /// Load templates and every persisted rule.
    pub async fn new(store: Arc<dyn PolicyStore>, config: EnforcerConfig) -> Result<Self> {
        let org_template = match &config.org_template {
            Some(path) => PolicyTemplate::load(DomainKind::Org, path)?,
            None => PolicyTemplate::builtin(DomainKind::Org),
        };
        let canvas_template = match &config.canvas_template {
            Some(path) => PolicyTemplate::load(DomainKind::Canvas, path)?,
            None => PolicyTemplate::builtin(DomainKind::Canvas),
        };

        let enforcer = Self {
            store,
            model: RwLock::new(Model::default()),
            cache: DecisionCache::new(config.cache_capacity, config.cache_enabled),
            org_template,
            canvas_template,
        };
        enforcer.reload().await?;
        Ok(enforcer)
    }

    /// Replace the in-memory model with the persisted rule set.
    pub async fn reload(&self) -> Result<()> {
        let rules = self.store.load().await?;
        let mut model = Model::default();
        for rule in &rules {
            model.apply(rule);
        }
        let mut current = self.model.write();
        *current = model;
        self.cache.clear();
        drop(current);
        debug!(rules = rules.len(), "policy rules loaded");
        Ok(())
    }

    pub fn enable_cache(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    /// Whether `user_id` may perform `action` on `resource` in the domain.
    pub fn check(&self, user_id: &str, kind: DomainKind, domain_id: &str, resource: &str, action: &str) -> bool {
        let subject = user_subject(user_id);
        let domain = kind.domain(domain_id);

        if let Some(allowed) = self.cache.get(&subject, &domain, resource, action) {
            return allowed;
        }

        // Cached under the read guard: a mutation invalidates only after the
        // guard is released, so a decision taken on retracted rules never
        // outlives the mutation.
        let model = self.model.read();
        let allowed = model.allows(&subject, &domain, resource, action);
        self.cache.put(&subject, &domain, resource, action, allowed);
        allowed
    }

    pub fn check_org(&self, user_id: &str, org_id: &str, resource: &str, action: &str) -> bool {
        self.check(user_id, DomainKind::Org, org_id, resource, action)
    }

    pub fn check_canvas(&self, user_id: &str, canvas_id: &str, resource: &str, action: &str) -> bool {
        self.check(user_id, DomainKind::Canvas, canvas_id, resource, action)
    }

    /// Like [`check`](Self::check) but as an error suitable for `?`.
    pub fn require(&self, user_id: &str, kind: DomainKind, domain_id: &str, resource: &str, action: &str) -> Result<()> {
        if self.check(user_id, kind, domain_id, resource, action) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "user {user_id} cannot {action} {resource} in {}",
                kind.domain(domain_id)
            )))
        }
    }

    /// Instantiate the organization template for a new organization.
    pub async fn setup_organization_roles(&self, org_id: &str) -> Result<()> {
        let rules = self.org_template.instantiate(org_id)?;
        self.add_rules(&DomainKind::Org.domain(org_id), rules).await?;
        info!(org_id, "organization roles provisioned");
        Ok(())
    }

    /// Instantiate the canvas template for a new canvas.
    pub async fn setup_canvas_roles(&self, canvas_id: &str) -> Result<()> {
        let rules = self.canvas_template.instantiate(canvas_id)?;
        self.add_rules(&DomainKind::Canvas.domain(canvas_id), rules).await?;
        info!(canvas_id, "canvas roles provisioned");
        Ok(())
    }

    pub async fn create_organization_owner(&self, user_id: &str, org_id: &str) -> Result<()> {
        self.assign_role(user_id, ORG_OWNER, org_id, DomainKind::Org).await
    }

    /// Give a user a role. Assigning a role the user already holds is a no-op.
    pub async fn assign_role(&self, user_id: &str, role: &str, domain_id: &str, kind: DomainKind) -> Result<()> {
        kind.require_role(role)?;
        let domain = kind.domain(domain_id);
        let rule = PolicyRule::edge(&user_subject(user_id), &role_subject(role), &domain);

        if self.contains(&rule) {
            return Ok(());
        }
        self.add_rules(&domain, vec![rule]).await?;
        info!(user_id, role, domain = %domain, "role assigned");
        Ok(())
    }

    /// Take a role from a user. Removing a role the user lacks is a no-op.
    pub async fn remove_role(&self, user_id: &str, role: &str, domain_id: &str, kind: DomainKind) -> Result<()> {
        kind.require_role(role)?;
        let domain = kind.domain(domain_id);
        let rule = PolicyRule::edge(&user_subject(user_id), &role_subject(role), &domain);

        if !self.contains(&rule) {
            return Ok(());
        }
        self.remove_rules(&domain, vec![rule]).await?;
        info!(user_id, role, domain = %domain, "role removed");
        Ok(())
    }

    /// Create a group in an organization, bound to one organization role.
    pub async fn create_group(&self, org_id: &str, group: &str, role: &str) -> Result<()> {
        DomainKind::Org.require_role(role)?;
        if group.trim().is_empty() {
            return Err(Error::Validation("group name is required".into()));
        }
        if self.group_role(org_id, group).is_ok() {
            return Err(Error::Conflict(format!("group {group} already exists")));
        }

        let domain = DomainKind::Org.domain(org_id);
        let rule = PolicyRule::edge(&group_subject(group), &role_subject(role), &domain);
        self.add_rules(&domain, vec![rule]).await?;
        info!(org_id, group, role, "group created");
        Ok(())
    }

    pub async fn add_user_to_group(&self, org_id: &str, user_id: &str, group: &str) -> Result<()> {
        self.group_role(org_id, group)?;
        let domain = DomainKind::Org.domain(org_id);
        let rule = PolicyRule::edge(&user_subject(user_id), &group_subject(group), &domain);
        if self.contains(&rule) {
            return Ok(());
        }
        self.add_rules(&domain, vec![rule]).await
    }

    pub async fn remove_user_from_group(&self, org_id: &str, user_id: &str, group: &str) -> Result<()> {
        self.group_role(org_id, group)?;
        let domain = DomainKind::Org.domain(org_id);
        let rule = PolicyRule::edge(&user_subject(user_id), &group_subject(group), &domain);
        if !self.contains(&rule) {
            return Err(Error::NotFound(format!(
                "user {user_id} is not a member of group {group}"
            )));
        }
        self.remove_rules(&domain, vec![rule]).await
    }

    pub fn group_users(&self, org_id: &str, group: &str) -> Result<Vec<String>> {
        self.group_role(org_id, group)?;
        let domain = DomainKind::Org.domain(org_id);
        Ok(strip_sorted(
            self.model.read().members(&group_subject(group), &domain),
            USER_PREFIX,
        ))
    }

    pub fn groups(&self, org_id: &str) -> Vec<String> {
        let domain = DomainKind::Org.domain(org_id);
        let model = self.model.read();
        let members: Vec<String> = model
            .edges
            .get(&domain)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, parents)| parents.iter().any(|p| p.starts_with(ROLE_PREFIX)))
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default();
        strip_sorted(members, GROUP_PREFIX)
    }

    /// The role a group was created with.
    pub fn group_role(&self, org_id: &str, group: &str) -> Result<String> {
        let domain = DomainKind::Org.domain(org_id);
        self.model
            .read()
            .parents(&group_subject(group), &domain)
            .find_map(|p| p.strip_prefix(ROLE_PREFIX).map(str::to_string))
            .ok_or_else(|| Error::not_found(format!("group {group}")))
    }

    /// Users holding `role` directly or through a group.
    pub fn users_for_role(&self, role: &str, domain_id: &str, kind: DomainKind) -> Result<Vec<String>> {
        kind.require_role(role)?;
        let domain = kind.domain(domain_id);
        let model = self.model.read();

        let mut users = BTreeSet::new();
        for member in model.members(&role_subject(role), &domain) {
            if let Some(user) = member.strip_prefix(USER_PREFIX) {
                users.insert(user.to_string());
            } else if member.starts_with(GROUP_PREFIX) {
                for via in model.members(&member, &domain) {
                    if let Some(user) = via.strip_prefix(USER_PREFIX) {
                        users.insert(user.to_string());
                    }
                }
            }
        }
        Ok(users.into_iter().collect())
    }

    /// Every role the user holds in the domain, including inherited ones.
    pub fn roles_for_user(&self, user_id: &str, domain_id: &str, kind: DomainKind) -> Vec<String> {
        let domain = kind.domain(domain_id);
        self.model
            .read()
            .expand(&user_subject(user_id), &domain)
            .into_iter()
            .filter_map(|s| s.strip_prefix(ROLE_PREFIX).map(str::to_string))
            .collect()
    }

    pub fn accessible_organizations(&self, user_id: &str) -> Vec<String> {
        self.model
            .read()
            .domains_of(&user_subject(user_id), DomainKind::Org)
    }

    pub fn accessible_canvases(&self, user_id: &str) -> Vec<String> {
        self.model
            .read()
            .domains_of(&user_subject(user_id), DomainKind::Canvas)
    }

    /// Permissions of a role, expanded through inheritance.
    pub fn role_permissions(&self, role: &str, domain_id: &str, kind: DomainKind) -> Result<Vec<Permission>> {
        kind.require_role(role)?;
        let domain = kind.domain(domain_id);
        let model = self.model.read();
        if !model.knows_role(role, &domain) {
            return Err(Error::not_found(format!("role {role}")));
        }

        Ok(model
            .permissions(&role_subject(role), &domain)
            .into_iter()
            .map(|(resource, action)| Permission {
                resource,
                action,
                domain_type: kind,
            })
            .collect())
    }

    /// `role` followed by every role it inherits from, nearest first.
    pub fn role_hierarchy(&self, role: &str, domain_id: &str, kind: DomainKind) -> Result<Vec<String>> {
        kind.require_role(role)?;
        let domain = kind.domain(domain_id);
        let model = self.model.read();
        if !model.knows_role(role, &domain) {
            return Err(Error::not_found(format!("role {role}")));
        }

        Ok(model
            .expand(&role_subject(role), &domain)
            .into_iter()
            .filter_map(|s| s.strip_prefix(ROLE_PREFIX).map(str::to_string))
            .collect())
    }

    pub fn role_definition(&self, role: &str, domain_id: &str, kind: DomainKind) -> Result<RoleDefinition> {
        let permissions = self.role_permissions(role, domain_id, kind)?;
        let domain = kind.domain(domain_id);
        let inherits_from = self
            .model
            .read()
            .parents(&role_subject(role), &domain)
            .find_map(|p| p.strip_prefix(ROLE_PREFIX).map(str::to_string));

        Ok(RoleDefinition {
            name: role.to_string(),
            domain_type: kind,
            description: role_description(role).to_string(),
            permissions,
            inherits_from,
            readonly: true,
        })
    }

    /// Definitions of every well-known role provisioned in the domain.
    pub fn role_definitions(&self, domain_id: &str, kind: DomainKind) -> Vec<RoleDefinition> {
        kind.roles()
            .iter()
            .filter_map(|role| self.role_definition(role, domain_id, kind).ok())
            .collect()
    }

    fn contains(&self, rule: &PolicyRule) -> bool {
        let model = self.model.read();
        match rule {
            PolicyRule::Edge {
                member,
                parent,
                domain,
            } => model.has_edge(member, parent, domain),
            PolicyRule::Grant {
                subject,
                domain,
                resource,
                action,
            } => model
                .grants
                .get(domain)
                .and_then(|g| g.get(subject))
                .is_some_and(|set| set.contains(&(resource.clone(), action.clone()))),
        }
    }

    async fn add_rules(&self, domain: &str, rules: Vec<PolicyRule>) -> Result<()> {
        self.store.add(&rules).await?;
        let mut model = self.model.write();
        for rule in &rules {
            model.apply(rule);
        }
        self.cache.invalidate_domain(domain);
        drop(model);
        Ok(())
    }

    async fn remove_rules(&self, domain: &str, rules: Vec<PolicyRule>) -> Result<()> {
        self.store.remove(&rules).await?;
        let mut model = self.model.write();
        for rule in &rules {
            model.retract(rule);
        }
        self.cache.invalidate_domain(domain);
        drop(model);
        Ok(())
    }
}

fn strip_sorted(subjects: Vec<String>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = subjects
        .into_iter()
        .filter_map(|s| s.strip_prefix(prefix).map(str::to_string))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct VecPolicyStore {
        rules: Mutex<Vec<PolicyRule>>,
    }

    #[async_trait]
    impl PolicyStore for VecPolicyStore {
        async fn load(&self) -> Result<Vec<PolicyRule>> {
            Ok(self.rules.lock().clone())
        }

        async fn add(&self, rules: &[PolicyRule]) -> Result<()> {
            let mut stored = self.rules.lock();
            for rule in rules {
                if !stored.contains(rule) {
                    stored.push(rule.clone());
                }
            }
            Ok(())
        }

        async fn remove(&self, rules: &[PolicyRule]) -> Result<()> {
            self.rules.lock().retain(|r| !rules.contains(r));
            Ok(())
        }
    }

    async fn enforcer() -> (Arc<VecPolicyStore>, Enforcer) {
        let store = Arc::new(VecPolicyStore::default());
        let enforcer = Enforcer::new(store.clone(), EnforcerConfig::default())
            .await
            .unwrap();
        enforcer.setup_organization_roles("o1").await.unwrap();
        enforcer.setup_canvas_roles("c1").await.unwrap();
        (store, enforcer)
    }

    #[tokio::test]
    async fn canvas_owner_holds_admin_and_viewer_permissions() {
        let (_, enforcer) = enforcer().await;
        enforcer
            .assign_role("u1", CANVAS_OWNER, "c1", DomainKind::Canvas)
            .await
            .unwrap();

        for role in [CANVAS_ADMIN, CANVAS_VIEWER] {
            for permission in enforcer.role_permissions(role, "c1", DomainKind::Canvas).unwrap() {
                assert!(
                    enforcer.check_canvas("u1", "c1", &permission.resource, &permission.action),
                    "owner lacks {}:{}",
                    permission.resource,
                    permission.action
                );
            }
        }
        assert!(enforcer.check_canvas("u1", "c1", "member", "remove"));
    }

    #[tokio::test]
    async fn org_admin_cannot_update_or_delete_org() {
        let (_, enforcer) = enforcer().await;
        enforcer
            .assign_role("u1", ORG_ADMIN, "o1", DomainKind::Org)
            .await
            .unwrap();

        assert!(enforcer.check_org("u1", "o1", "canvas", "create"));
        assert!(enforcer.check_org("u1", "o1", "org", "read"));
        assert!(!enforcer.check_org("u1", "o1", "org", "update"));
        assert!(!enforcer.check_org("u1", "o1", "org", "delete"));
    }

    #[tokio::test]
    async fn no_grant_means_deny() {
        let (_, enforcer) = enforcer().await;
        assert!(!enforcer.check_canvas("stranger", "c1", "stage", "read"));
        enforcer
            .assign_role("u1", CANVAS_VIEWER, "c1", DomainKind::Canvas)
            .await
            .unwrap();
        // Roles do not leak across domains.
        assert!(!enforcer.check_canvas("u1", "c2", "stage", "read"));
        assert!(!enforcer.check_canvas("u1", "c1", "stage", "create"));
    }

    #[tokio::test]
    async fn removal_takes_effect_through_the_cache() {
        let (_, enforcer) = enforcer().await;
        enforcer
            .assign_role("u1", CANVAS_ADMIN, "c1", DomainKind::Canvas)
            .await
            .unwrap();
        assert!(enforcer.check_canvas("u1", "c1", "stage", "create"));

        enforcer
            .remove_role("u1", CANVAS_ADMIN, "c1", DomainKind::Canvas)
            .await
            .unwrap();
        assert!(!enforcer.check_canvas("u1", "c1", "stage", "create"));

        // Idempotent.
        enforcer
            .remove_role("u1", CANVAS_ADMIN, "c1", DomainKind::Canvas)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn revocation_is_not_undone_by_concurrent_checks() {
        let (_, enforcer) = enforcer().await;
        let enforcer = Arc::new(enforcer);

        for _ in 0..50 {
            enforcer
                .assign_role("u1", CANVAS_ADMIN, "c1", DomainKind::Canvas)
                .await
                .unwrap();
            assert!(enforcer.check_canvas("u1", "c1", "stage", "create"));

            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let checkers: Vec<_> = (0..3)
                .map(|_| {
                    let enforcer = enforcer.clone();
                    let stop = stop.clone();
                    tokio::task::spawn_blocking(move || {
                        while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                            enforcer.check_canvas("u1", "c1", "stage", "create");
                        }
                    })
                })
                .collect();

            enforcer
                .remove_role("u1", CANVAS_ADMIN, "c1", DomainKind::Canvas)
                .await
                .unwrap();
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            for checker in checkers {
                checker.await.unwrap();
            }

            assert!(!enforcer.check_canvas("u1", "c1", "stage", "create"));
        }
    }

    #[tokio::test]
    async fn assigning_a_role_from_the_other_domain_kind_is_rejected() {
        let (_, enforcer) = enforcer().await;
        let err = enforcer
            .assign_role("u1", ORG_ADMIN, "c1", DomainKind::Canvas)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn groups_grant_their_role_to_members() {
        let (_, enforcer) = enforcer().await;
        enforcer.create_group("o1", "ops", ORG_ADMIN).await.unwrap();
        enforcer.add_user_to_group("o1", "u1", "ops").await.unwrap();

        assert!(enforcer.check_org("u1", "o1", "canvas", "create"));
        assert_eq!(enforcer.groups("o1"), vec!["ops"]);
        assert_eq!(enforcer.group_role("o1", "ops").unwrap(), ORG_ADMIN);
        assert_eq!(enforcer.group_users("o1", "ops").unwrap(), vec!["u1"]);
        assert_eq!(
            enforcer.users_for_role(ORG_ADMIN, "o1", DomainKind::Org).unwrap(),
            vec!["u1"]
        );
        assert_eq!(
            enforcer.roles_for_user("u1", "o1", DomainKind::Org),
            vec![ORG_ADMIN, ORG_VIEWER]
        );

        enforcer.remove_user_from_group("o1", "u1", "ops").await.unwrap();
        assert!(!enforcer.check_org("u1", "o1", "canvas", "create"));
    }

    #[tokio::test]
    async fn group_errors() {
        let (_, enforcer) = enforcer().await;
        enforcer.create_group("o1", "ops", ORG_VIEWER).await.unwrap();

        let duplicate = enforcer.create_group("o1", "ops", ORG_ADMIN).await.unwrap_err();
        assert_eq!(duplicate.kind(), crate::error::ErrorKind::Conflict);

        let missing = enforcer.add_user_to_group("o1", "u1", "nope").await.unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::NotFound);

        let non_member = enforcer
            .remove_user_from_group("o1", "u1", "ops")
            .await
            .unwrap_err();
        assert_eq!(non_member.kind(), crate::error::ErrorKind::NotFound);

        let canvas_role = enforcer.create_group("o1", "x", CANVAS_ADMIN).await.unwrap_err();
        assert_eq!(canvas_role.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn hierarchy_and_definitions() {
        let (_, enforcer) = enforcer().await;
        assert_eq!(
            enforcer.role_hierarchy(ORG_OWNER, "o1", DomainKind::Org).unwrap(),
            vec![ORG_OWNER, ORG_ADMIN, ORG_VIEWER]
        );

        let admin = enforcer
            .role_definition(CANVAS_ADMIN, "c1", DomainKind::Canvas)
            .unwrap();
        assert_eq!(admin.inherits_from.as_deref(), Some(CANVAS_VIEWER));
        assert!(admin
            .permissions
            .iter()
            .any(|p| p.resource == "stage" && p.action == "read"));
        assert!(!admin
            .permissions
            .iter()
            .any(|p| p.resource == "member" && p.action == "remove"));

        assert_eq!(enforcer.role_definitions("c1", DomainKind::Canvas).len(), 3);
        assert!(enforcer.role_definitions("c9", DomainKind::Canvas).is_empty());
    }

    #[tokio::test]
    async fn accessible_domains_follow_assignments() {
        let (_, enforcer) = enforcer().await;
        enforcer.setup_canvas_roles("c2").await.unwrap();
        enforcer.create_organization_owner("u1", "o1").await.unwrap();
        enforcer
            .assign_role("u1", CANVAS_VIEWER, "c2", DomainKind::Canvas)
            .await
            .unwrap();

        assert_eq!(enforcer.accessible_organizations("u1"), vec!["o1"]);
        assert_eq!(enforcer.accessible_canvases("u1"), vec!["c2"]);
        assert!(enforcer.accessible_canvases("u2").is_empty());
    }

    #[tokio::test]
    async fn rules_survive_reload_from_store() {
        let (store, enforcer) = enforcer().await;
        enforcer
            .assign_role("u1", CANVAS_ADMIN, "c1", DomainKind::Canvas)
            .await
            .unwrap();

        let reloaded = Enforcer::new(store, EnforcerConfig::default()).await.unwrap();
        assert!(reloaded.check_canvas("u1", "c1", "secret", "read"));
    }

    #[tokio::test]
    async fn cache_can_be_disabled() {
        let (_, enforcer) = enforcer().await;
        enforcer.enable_cache(false);
        assert!(!enforcer.check_canvas("u1", "c1", "stage", "read"));
        assert_eq!(enforcer.cache.len(), 0);
    }
}
