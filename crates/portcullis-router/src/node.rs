//! Radix-tree matching over path templates.

use crate::error::{RouterError, RouterResult};
use crate::params::PathParams;
use crate::permission_set::PermissionSet;

/// Kind of a template segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentKind {
    /// Literal segment (`users`, `v2`).
    Static(String),
    /// Named capture (`{id}`).
    Param(String),
    /// Trailing `/*`: the route matches everything below this point.
    Prefix,
}

/// Route registration attached to a terminal node.
#[derive(Debug, Clone)]
pub(crate) struct RouteData {
    /// The template exactly as written in the OpenAPI document.
    pub template: String,
    /// True for `/*` prefix routes.
    pub prefix: bool,
    /// Method registrations for this template.
    pub methods: PermissionSet,
}

/// A node of the matching tree.
///
/// Children are split by kind so lookup can apply priority directly:
/// statics first, then the single `{param}` child, then the prefix capture.
#[derive(Debug, Clone, Default)]
pub struct Node {
    route: Option<RouteData>,
    static_children: Vec<(String, Node)>,
    param_child: Option<(String, Box<Node>)>,
    prefix_child: Option<Box<Node>>,
}

impl Node {
    /// Creates an empty root node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits a template into segments, validating prefix placement.
    fn parse_template(template: &str) -> RouterResult<Vec<SegmentKind>> {
        let segments: Vec<SegmentKind> = template
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if let Some(name) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    SegmentKind::Param(name.to_string())
                } else if s == "*" {
                    SegmentKind::Prefix
                } else {
                    SegmentKind::Static(s.to_string())
                }
            })
            .collect();

        if let Some(pos) = segments
            .iter()
            .position(|s| matches!(s, SegmentKind::Prefix))
        {
            if pos + 1 != segments.len() {
                return Err(RouterError::PrefixPosition(template.to_string()));
            }
        }

        Ok(segments)
    }

    /// Registers `config` for `(method, template)`.
    pub(crate) fn insert(
        &mut self,
        template: &str,
        method: http::Method,
        config: crate::oas::RondConfig,
    ) -> RouterResult<()> {
        let segments = Self::parse_template(template)?;
        self.insert_segments(&segments, template, method, config)
    }

    fn insert_segments(
        &mut self,
        segments: &[SegmentKind],
        template: &str,
        method: http::Method,
        config: crate::oas::RondConfig,
    ) -> RouterResult<()> {
        let Some((head, rest)) = segments.split_first() else {
            let route = self.route.get_or_insert_with(|| RouteData {
                template: template.to_string(),
                prefix: false,
                methods: PermissionSet::new(),
            });
            return route.methods.insert(method, config, template);
        };

        match head {
            SegmentKind::Static(segment) => {
                let index = self
                    .static_children
                    .iter()
                    .position(|(s, _)| s == segment)
                    .unwrap_or_else(|| {
                        self.static_children.push((segment.clone(), Node::new()));
                        self.static_children.len() - 1
                    });
                self.static_children[index]
                    .1
                    .insert_segments(rest, template, method, config)
            }
            SegmentKind::Param(name) => {
                let (existing, child) = self
                    .param_child
                    .get_or_insert_with(|| (name.clone(), Box::new(Node::new())));
                if existing != name {
                    // Sibling templates must agree on the capture name,
                    // otherwise the same request would bind two names.
                    return Err(RouterError::ambiguous(method.as_str(), template));
                }
                child.insert_segments(rest, template, method, config)
            }
            SegmentKind::Prefix => {
                let child = self
                    .prefix_child
                    .get_or_insert_with(|| Box::new(Node::new()));
                let route = child.route.get_or_insert_with(|| RouteData {
                    template: template.to_string(),
                    prefix: true,
                    methods: PermissionSet::new(),
                });
                route.methods.insert(method, config, template)
            }
        }
    }

    /// Matches a request path, returning the terminal route data and the
    /// captured parameters.
    pub(crate) fn match_path(&self, path: &str) -> Option<(&RouteData, PathParams)> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = PathParams::new();
        self.match_segments(&segments, &mut params)
            .map(|route| (route, params))
    }

    fn match_segments<'a>(
        &'a self,
        segments: &[&str],
        params: &mut PathParams,
    ) -> Option<&'a RouteData> {
        let Some((segment, rest)) = segments.split_first() else {
            // Exhausted the path: an exact route wins, otherwise a prefix
            // route registered at this level still covers it.
            if self.route.is_some() {
                return self.route.as_ref();
            }
            return self.prefix_child.as_ref().and_then(|c| c.route.as_ref());
        };

        if let Some((_, child)) = self.static_children.iter().find(|(s, _)| s == segment) {
            if let Some(found) = child.match_segments(rest, params) {
                return Some(found);
            }
        }

        if let Some((name, child)) = &self.param_child {
            params.push(name.clone(), (*segment).to_string());
            if let Some(found) = child.match_segments(rest, params) {
                return Some(found);
            }
            params.pop();
        }

        if let Some(child) = &self.prefix_child {
            return child.route.as_ref();
        }

        None
    }

    /// Visits every registered route.
    pub(crate) fn visit_routes<'a>(&'a self, visit: &mut impl FnMut(&'a RouteData)) {
        if let Some(route) = &self.route {
            visit(route);
        }
        for (_, child) in &self.static_children {
            child.visit_routes(visit);
        }
        if let Some((_, child)) = &self.param_child {
            child.visit_routes(visit);
        }
        if let Some(child) = &self.prefix_child {
            child.visit_routes(visit);
        }
    }
}
