//! Lowers a root installation and its dependency tree into a workflow.
//!
//! Jobs are planned depth first: a dependency's own dependencies become
//! jobs that precede it, keyed `PARENTKEY/DEPKEY`. All jobs land in a
//! single stage and `depends` edges order them.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::bundle::definition::Bundle;
use crate::bundle::{
    ACTION_INSTALL, ACTION_UNINSTALL, ACTION_UPGRADE, BundleReference, Dependencies, Dependency,
    OciReferenceParts, Reference,
};
use crate::context::Context;
use crate::dag::{DependencyGraph, DependencyNode, validate_wiring};
use crate::errors::{BundleError, Result};
use crate::resolver::{BundleResolver, ResolveOptions};
use crate::storage::documents::{Installation, InstallationSpec};
use crate::storage::query::Query;
use crate::storage::Storage;
use crate::workflow::model::{
    ACTION_NONE, Job, JobStatus, Stage, WORKFLOW_SCHEMA_VERSION, Workflow, WorkflowSpec,
};
use crate::workflow::wiring::{
    ROOT_JOB_KEY, child_job_key, dependency_installation_name, lower, shared_installation_name,
};

/// Label carried by installations created for a sharing group.
pub const SHARING_GROUP_LABEL: &str = "sh.bundlectl.sharing-group";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// 0 means number of CPUs.
    pub max_parallel: usize,
    pub debug_mode: bool,
    /// Root action to plan instead of the one derived from the
    /// installation's state.
    pub action: Option<String>,
    pub resolve: ResolveOptions,
    /// `--param` values recorded on the root job.
    pub overrides: BTreeMap<String, String>,
}

#[derive(Default)]
struct PlanState {
    jobs: Vec<Job>,
    /// Repositories from the root down to the bundle being planned.
    chain: Vec<String>,
    uninstall: bool,
}

#[derive(Debug, Clone)]
pub struct Planner {
    storage: Storage,
    resolver: BundleResolver,
}

impl Planner {
    pub fn new(storage: Storage, resolver: BundleResolver) -> Self {
        Self { storage, resolver }
    }

    /// Plan a workflow for `root`, whose bundle is already resolved.
    pub async fn plan(
        &self,
        ctx: &Context,
        root: &InstallationSpec,
        bundle: &BundleReference,
        opts: &PlanOptions,
    ) -> Result<Workflow> {
        let root_action = match &opts.action {
            Some(action) => action.clone(),
            None => self.action_for(ctx, root, root.uninstalled).await?,
        };
        let mut state = PlanState {
            chain: vec![bundle.reference.repository()],
            uninstall: root_action == ACTION_UNINSTALL,
            ..Default::default()
        };

        let direct = self
            .plan_dependencies(
                ctx,
                ROOT_JOB_KEY.to_string(),
                root.clone(),
                bundle.definition.clone(),
                &mut state,
                opts,
            )
            .await?;

        state.jobs.push(Job {
            key: ROOT_JOB_KEY.to_string(),
            action: root_action,
            installation: root.clone(),
            depends: direct,
            overrides: opts.overrides.clone(),
            status: JobStatus::default(),
        });

        if state.uninstall {
            invert_depends(&mut state.jobs);
        }

        let mut stage = Stage::default();
        for job in state.jobs {
            stage.jobs.insert(job.key.clone(), job);
        }
        info!(
            namespace = %root.namespace,
            installation = %root.name,
            jobs = stage.jobs.len(),
            "planned workflow"
        );

        Ok(Workflow::new(
            root.namespace.clone(),
            root.name.clone(),
            WorkflowSpec {
                schema_version: WORKFLOW_SCHEMA_VERSION.to_string(),
                max_parallel: if opts.debug_mode { 1 } else { opts.max_parallel },
                debug_mode: opts.debug_mode,
                stages: vec![stage],
            },
        ))
    }

    /// Plan jobs for the dependencies of `bundle`, returning the keys of its
    /// direct dependency jobs.
    fn plan_dependencies<'a>(
        &'a self,
        ctx: &'a Context,
        parent_key: String,
        parent: InstallationSpec,
        bundle: Bundle,
        state: &'a mut PlanState,
        opts: &'a PlanOptions,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let Some(deps) = Dependencies::from_bundle(&bundle)? else {
                return Ok(Vec::new());
            };
            if parent_key == ROOT_JOB_KEY && deps.requires.get(ROOT_JOB_KEY).is_some() {
                return Err(BundleError::invalid_manifest(format!(
                    "bundle {} declares a dependency named {ROOT_JOB_KEY:?}, which is reserved",
                    bundle.name
                )));
            }

            let graph = DependencyGraph::build(&deps)?;
            let order: Vec<DependencyNode> = graph.topo_sort()?.into_iter().cloned().collect();

            let mut resolved: BTreeMap<String, BundleReference> = BTreeMap::new();
            for node in &order {
                let r = self
                    .resolve_dependency(ctx, &node.dependency, opts.resolve)
                    .await?;
                resolved.insert(node.key.clone(), r);
            }
            let bundles: BTreeMap<String, Bundle> = resolved
                .iter()
                .map(|(k, r)| (k.clone(), r.definition.clone()))
                .collect();
            validate_wiring(&graph, &bundles)?;

            let mut direct = Vec::with_capacity(order.len());
            for node in &order {
                let Some(dep_bundle) = resolved.get(&node.key) else {
                    continue;
                };
                let key = child_job_key(&parent_key, &node.key);
                let repository = dep_bundle.reference.repository();
                if let Some(pos) = state.chain.iter().position(|r| r == &repository) {
                    let mut path: Vec<String> = state.chain[pos..].to_vec();
                    path.push(repository);
                    return Err(BundleError::CyclicDependency {
                        path: path.join(" -> "),
                    });
                }
                let siblings: Vec<String> = graph
                    .dependencies_of(&node.key)
                    .into_iter()
                    .map(|d| child_job_key(&parent_key, d))
                    .collect();

                if let Some(group) = node.dependency.sharing_group() {
                    if let Some(existing) = self
                        .find_shared(ctx, &parent.namespace, group, &node.dependency, &dep_bundle.reference)
                        .await?
                    {
                        info!(
                            job = %key,
                            group,
                            installation = %existing.name(),
                            "reusing shared installation"
                        );
                        state.jobs.push(Job {
                            key: key.clone(),
                            action: ACTION_NONE.to_string(),
                            installation: existing.spec.clone(),
                            depends: siblings,
                            overrides: BTreeMap::new(),
                            status: JobStatus::default(),
                        });
                        direct.push(key);
                        continue;
                    }
                }

                let spec = dependency_spec(&parent_key, &parent, node, dep_bundle, state.uninstall);
                state.chain.push(repository);
                let nested = self
                    .plan_dependencies(
                        ctx,
                        key.clone(),
                        spec.clone(),
                        dep_bundle.definition.clone(),
                        state,
                        opts,
                    )
                    .await?;
                state.chain.pop();

                let action = self.action_for(ctx, &spec, state.uninstall).await?;
                debug!(job = %key, installation = %spec.name, %action, "planned dependency job");
                let mut depends = siblings;
                depends.extend(nested);
                state.jobs.push(Job {
                    key: key.clone(),
                    action,
                    installation: spec,
                    depends,
                    overrides: BTreeMap::new(),
                    status: JobStatus::default(),
                });
                direct.push(key);
            }
            Ok(direct)
        })
    }

    async fn resolve_dependency(
        &self,
        ctx: &Context,
        dep: &Dependency,
        opts: ResolveOptions,
    ) -> Result<BundleReference> {
        let mut reference = dep.reference()?;
        if reference.digest().is_none() {
            if let Some(spec) = dep.version_spec() {
                reference = self.resolver.resolve_version(ctx, &reference, spec).await?;
            }
        }
        if reference.tag().is_none() && reference.digest().is_none() {
            reference = reference.with_tag("latest");
        }
        self.resolver.resolve(ctx, &reference, opts).await
    }

    async fn action_for(&self, ctx: &Context, spec: &InstallationSpec, uninstall: bool) -> Result<String> {
        if uninstall {
            return Ok(ACTION_UNINSTALL.to_string());
        }
        match self.storage.get_installation(ctx, &spec.namespace, &spec.name).await {
            Ok(existing) if existing.status.installation_completed => Ok(ACTION_UPGRADE.to_string()),
            Ok(_) => Ok(ACTION_INSTALL.to_string()),
            Err(e) if e.is_not_found() => Ok(ACTION_INSTALL.to_string()),
            Err(e) => Err(e),
        }
    }

    /// An installed member of `group` in `namespace` running the same
    /// repository at a version the dependency accepts.
    async fn find_shared(
        &self,
        ctx: &Context,
        namespace: &str,
        group: &str,
        dep: &Dependency,
        reference: &Reference,
    ) -> Result<Option<Installation>> {
        let candidates = self
            .storage
            .list_installations(ctx, &Query::new().namespace(namespace).sort_by("name"))
            .await?;
        for inst in candidates {
            if inst.spec.labels.get(SHARING_GROUP_LABEL).map(String::as_str) != Some(group) {
                continue;
            }
            if !inst.is_installed() {
                continue;
            }
            let same_repo = Reference::parse(&inst.spec.bundle.repository)
                .is_ok_and(|r| r.repository() == reference.repository());
            if !same_repo {
                continue;
            }
            if let Some(spec) = dep.version_spec() {
                let version = inst
                    .status
                    .bundle_version
                    .trim_start_matches('v')
                    .parse::<semver::Version>();
                match version {
                    Ok(v) if spec.matches(&v)? => {}
                    _ => continue,
                }
            }
            return Ok(Some(inst));
        }
        Ok(None)
    }
}

fn dependency_spec(
    parent_key: &str,
    parent: &InstallationSpec,
    node: &DependencyNode,
    bundle: &BundleReference,
    uninstall: bool,
) -> InstallationSpec {
    let name = match node.dependency.sharing_group() {
        Some(group) => shared_installation_name(group, &node.key),
        None => dependency_installation_name(&parent.name, &node.key),
    };
    let mut spec = InstallationSpec::new(parent.namespace.clone(), name);
    spec.bundle = OciReferenceParts::from_reference(&bundle.reference);
    spec.parameters = node
        .parameters
        .iter()
        .map(|(n, w)| lower(n, w, parent_key))
        .collect();
    spec.credentials = node
        .credentials
        .iter()
        .map(|(n, w)| lower(n, w, parent_key))
        .collect();
    if let Some(group) = node.dependency.sharing_group() {
        spec.labels
            .insert(SHARING_GROUP_LABEL.to_string(), group.to_string());
    }
    spec.uninstalled = uninstall;
    spec
}

/// Uninstall runs consumers first: every edge is reversed.
fn invert_depends(jobs: &mut [Job]) {
    let mut inverted: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for job in jobs.iter() {
        for dep in &job.depends {
            inverted.entry(dep.clone()).or_default().push(job.key.clone());
        }
    }
    for job in jobs.iter_mut() {
        let mut depends = inverted.remove(&job.key).unwrap_or_default();
        depends.sort();
        job.depends = depends;
    }
}
